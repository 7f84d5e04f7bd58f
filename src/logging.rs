//! Process-wide tracing setup
//!
//! Events go to stderr as JSON lines or as human-readable text. `RUST_LOG`,
//! when set and valid, replaces the computed filter entirely; otherwise the
//! broker and HTTP client crates are held at `warn` so that task logs stay
//! readable at `debug`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Dependency targets that only log at `warn` and above
const QUIET_TARGETS: &[&str] = &["lapin", "amq_protocol", "pinky_swear", "reqwest", "hyper"];

/// Verbosity, ordered from quietest to loudest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Lenient parse; anything unrecognized means `Info`
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "error" | "critical" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    pub fn new(level: &str, format: &str) -> Self {
        Self {
            level: LogLevel::parse(level),
            format: LogFormat::parse(format),
        }
    }

    /// Raise the level to at least `Debug` when `force` is set
    pub fn force_debug(mut self, force: bool) -> Self {
        if force {
            self.level = self.level.max(LogLevel::Debug);
        }
        self
    }

    /// Filter directives used when `RUST_LOG` is absent
    pub fn directives(&self) -> String {
        let mut directives = self.level.as_str().to_string();
        if self.level > LogLevel::Warn {
            for target in QUIET_TARGETS {
                directives.push_str(&format!(",{}=warn", target));
            }
        }
        directives
    }
}

/// Install the global subscriber; fails if one is already set
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.directives())?,
    };

    let output = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_thread_names(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_thread_names(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()?;
    Ok(())
}
