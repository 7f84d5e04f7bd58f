//! Prometheus metrics collection and HTTP endpoint
//!
//! Metrics are exposed on `127.0.0.1:<port>/metrics` when a metrics port is
//! configured.
//!
//! # Available Metrics
//!
//! - `remexec_tasks_total{protocol, code}` - Counter of completed remote commands
//! - `remexec_task_duration_seconds{protocol}` - Histogram of command durations
//! - `remexec_active_sessions` - Gauge of sessions currently running
//! - `remexec_replies_failed_total` - Counter of replies that could not be published
//! - `remexec_memory_bytes` - Gauge of process memory usage (RSS)
//!
//! # Example
//!
//! ```no_run
//! use remexec::metrics::AgentMetrics;
//! use remexec::models::{Protocol, StatusCode};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let metrics = AgentMetrics::new()?;
//! let shutdown = tokio_util::sync::CancellationToken::new();
//! metrics.start(9090, shutdown.clone()).await?;
//!
//! metrics.record_task(Protocol::Ssh, StatusCode::Success, 1.5);
//! # Ok(())
//! # }
//! ```

use crate::models::{Protocol, StatusCode};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    TEXT_FORMAT,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Histogram bucket boundaries for command duration (in seconds)
const TASK_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 600.0];

/// Agent metrics registry
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Arc<Registry>,
    tasks: CounterVec,
    task_duration: HistogramVec,
    active_sessions: Gauge,
    replies_failed: Counter,
    memory_bytes: Gauge,
}

impl AgentMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let tasks = CounterVec::new(
            Opts::new("remexec_tasks_total", "Total number of remote commands"),
            &["protocol", "code"],
        )?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "remexec_task_duration_seconds",
                "Remote command duration in seconds",
            )
            .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["protocol"],
        )?;

        let active_sessions =
            Gauge::with_opts(Opts::new("remexec_active_sessions", "Active remote sessions"))?;

        let replies_failed = Counter::with_opts(Opts::new(
            "remexec_replies_failed_total",
            "Replies lost to serialization or publish failures",
        ))?;

        let memory_bytes = Gauge::with_opts(Opts::new(
            "remexec_memory_bytes",
            "Process memory usage in bytes (RSS)",
        ))?;

        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(replies_failed.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            tasks,
            task_duration,
            active_sessions,
            replies_failed,
            memory_bytes,
        })
    }

    /// Serve `/metrics` on localhost until `shutdown` fires
    pub async fn start(
        &self,
        port: u16,
        shutdown: CancellationToken,
    ) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!("Metrics endpoint on http://{}/metrics", listener.local_addr()?);

        let metrics = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!("Metrics accept failed: {}", e);
                            continue;
                        }
                    },
                };
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(e) = metrics.answer(stream).await {
                        debug!("Metrics scrape failed: {}", e);
                    }
                });
            }
            debug!("Metrics endpoint closed");
        }))
    }

    async fn answer(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let mut head = [0u8; 512];
        let n = stream.read(&mut head).await?;

        let response = if head[..n].starts_with(b"GET /metrics") {
            let body = self.render()?;
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                TEXT_FORMAT,
                body.len(),
                body
            )
        } else {
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
        };
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Current metrics in Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        if let Some(rss) = resident_bytes() {
            self.memory_bytes.set(rss as f64);
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Record a completed remote command
    pub fn record_task(&self, protocol: Protocol, code: StatusCode, duration_secs: f64) {
        let code = code.code().to_string();
        self.tasks
            .with_label_values(&[protocol.as_str(), code.as_str()])
            .inc();
        self.task_duration
            .with_label_values(&[protocol.as_str()])
            .observe(duration_secs);
    }

    pub fn session_started(&self) {
        self.active_sessions.inc();
    }

    pub fn session_finished(&self) {
        self.active_sessions.dec();
    }

    pub fn reply_failed(&self) {
        self.replies_failed.inc();
    }
}

/// Peak resident set size of this process in bytes
#[cfg(unix)]
fn resident_bytes() -> Option<u64> {
    // ru_maxrss is reported in kilobytes everywhere but macOS
    const SCALE: u64 = if cfg!(target_os = "macos") { 1 } else { 1024 };

    // SAFETY: getrusage only writes into the zeroed struct we own
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return None;
        }
        usage
    };
    u64::try_from(usage.ru_maxrss).ok().map(|rss| rss * SCALE)
}

#[cfg(not(unix))]
fn resident_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_task() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.record_task(Protocol::Ssh, StatusCode::Success, 0.7);
        metrics.record_task(Protocol::Telnet, StatusCode::PermissionDenied, 2.0);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"remexec_tasks_total{code="0",protocol="ssh"} 1"#));
        assert!(text.contains(r#"remexec_tasks_total{code="-2",protocol="telnet"} 1"#));
        assert!(text.contains("remexec_task_duration_seconds_bucket"));
    }

    #[test]
    fn test_sessions_and_failed_replies() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.session_started();
        metrics.session_started();
        metrics.session_finished();
        metrics.reply_failed();

        let text = metrics.render().unwrap();
        assert!(text.contains("remexec_active_sessions 1"));
        assert!(text.contains("remexec_replies_failed_total 1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resident_bytes() {
        assert!(resident_bytes().unwrap() > 0);
        let text = AgentMetrics::new().unwrap().render().unwrap();
        assert!(text.contains("remexec_memory_bytes"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.reply_failed();

        // Pick a free port
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let shutdown = CancellationToken::new();
        let server = metrics.start(port, shutdown.clone()).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("remexec_replies_failed_total 1"));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404"));

        shutdown.cancel();
        server.await.unwrap();
    }
}
