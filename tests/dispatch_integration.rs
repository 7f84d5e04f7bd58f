//! End-to-end routing: raw delivery → front door → task → scheduler → reply

use async_trait::async_trait;
use parking_lot::Mutex;
use remexec::broker::{DeliveryMeta, Publisher, ReplyTarget};
use remexec::dispatch::{Dispatcher, FrontDoor, Routed};
use remexec::error::Result;
use remexec::executors::ExecutorSettings;
use remexec::reply::ReplyChannel;
use remexec::scheduler::{SchedulerSettings, TaskScheduler};
use remexec::task::TaskContext;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<(Value, ReplyTarget)>>,
}

impl RecordingPublisher {
    fn wait_for(&self, count: usize, timeout: Duration) -> Vec<(Value, ReplyTarget)> {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.sent.lock().len() >= count {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, payload: Vec<u8>, target: &ReplyTarget, _block: bool) -> Result<()> {
        let value = serde_json::from_slice(&payload)?;
        self.sent.lock().push((value, target.clone()));
        Ok(())
    }
}

fn dispatcher(name: &str, publisher: Arc<RecordingPublisher>) -> Dispatcher {
    let executor = ExecutorSettings {
        telnet_drain_pause: Duration::from_millis(50),
        ..ExecutorSettings::default()
    };
    Dispatcher::new(TaskContext {
        scheduler: TaskScheduler::start(SchedulerSettings::new(name, 8)).unwrap(),
        reply: ReplyChannel::new(publisher, false),
        executor: Arc::new(executor),
        metrics: None,
        version: "0.1.0-test".to_string(),
    })
}

fn meta() -> DeliveryMeta {
    DeliveryMeta::with_reply_to("results/agent.reply")
}

/// Single-connection Telnet host that accepts any login and echoes one command
fn spawn_telnet_host() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut buf = [0u8; 256];

        socket.write_all(b"router login: ").unwrap();
        let _ = socket.read(&mut buf).unwrap();
        socket.write_all(b"Password: ").unwrap();
        let _ = socket.read(&mut buf).unwrap();
        socket
            .write_all(b"\r\nLast login: Thu Oct 15 09:00:00 from 10.0.0.1\r\nrouter> ")
            .unwrap();

        let n = socket.read(&mut buf).unwrap();
        let command = String::from_utf8_lossy(&buf[..n]).trim().to_string();
        let reply = format!("{}\r\nuptime 42 days\r\nrouter> ", command);
        socket.write_all(reply.as_bytes()).unwrap();

        // Hold the socket open until the agent hangs up
        let _ = socket.read(&mut buf);
    });

    port
}

#[test]
fn test_non_json_payload_dropped_without_reply() {
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = dispatcher("it-garbage", publisher.clone());

    let routed = dispatcher.handle(b"\x00\x01 definitely not json", meta());
    assert_eq!(
        routed,
        Routed::Dropped {
            task_type: String::new()
        }
    );

    let routed = dispatcher.handle(br#"{"id": "u-1"}"#, meta());
    assert_eq!(
        routed,
        Routed::Dropped {
            task_type: "unknown".to_string()
        }
    );

    std::thread::sleep(Duration::from_millis(100));
    assert!(publisher.sent.lock().is_empty());
    dispatcher.context().scheduler.stop();
}

#[test]
fn test_recognized_but_unsupported_types() {
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = dispatcher("it-unsupported", publisher.clone());

    for task_type in ["detect", "scan", "site"] {
        let payload = json!({"id": "x", "type": task_type}).to_string();
        let routed = dispatcher.handle(payload.as_bytes(), meta());
        assert_eq!(
            routed,
            Routed::Unsupported {
                task_type: task_type.to_string()
            }
        );
    }
    assert!(publisher.sent.lock().is_empty());
    dispatcher.context().scheduler.stop();
}

#[test]
fn test_missing_connection_yields_exactly_one_rejection() {
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = dispatcher("it-reject", publisher.clone());

    let payload = json!({
        "id": "g-missing-conn",
        "type": "gather",
        "account": {"username": "admin", "password": "pw"},
        "task": {"cmd": "show version"}
    })
    .to_string();

    let routed = dispatcher.handle(payload.as_bytes(), meta());
    assert_eq!(
        routed,
        Routed::Rejected {
            id: Some("g-missing-conn".to_string()),
            reason: "Not connection info".to_string()
        }
    );

    let sent = publisher.wait_for(1, Duration::from_secs(2));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(publisher.sent.lock().len(), 1);

    let (reply, target) = &sent[0];
    assert_eq!(target, &ReplyTarget::new("results", "agent.reply"));
    assert_eq!(reply["id"], "g-missing-conn");
    assert_eq!(reply["code"], -6);
    assert_eq!(reply["err_info"], "Not connection info");
    assert_eq!(reply["cmd"], "");
    dispatcher.context().scheduler.stop();
}

#[test]
fn test_ipv6_target_rejected() {
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = dispatcher("it-ipv6", publisher.clone());

    let payload = json!({
        "id": "g-v6",
        "type": "gather",
        "account": {"username": "admin", "password": "pw"},
        "conn": {"ip": "::1", "port": 22, "proto": "ssh"},
        "task": {"cmd": "id"}
    })
    .to_string();

    assert!(matches!(
        dispatcher.handle(payload.as_bytes(), meta()),
        Routed::Rejected { .. }
    ));
    let sent = publisher.wait_for(1, Duration::from_secs(2));
    assert_eq!(sent[0].0["code"], -6);
    dispatcher.context().scheduler.stop();
}

#[test]
fn test_gather_over_telnet_through_front_door() {
    let port = spawn_telnet_host();
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = Arc::new(dispatcher("it-telnet", publisher.clone()));
    let mut front_door = FrontDoor::start(dispatcher.clone(), 2).unwrap();
    let inbox = front_door.inbox().unwrap();

    let payload = json!({
        "id": "g-telnet",
        "type": "gather",
        "account": {"username": "admin", "password": "pw"},
        "conn": {"ip": "localhost", "port": port.to_string(), "sysType": "router", "proto": "telnet"},
        "task": {"cmd": "show uptime", "mto": 10},
        "encoding": "utf-8"
    })
    .to_string();
    assert!(inbox.push(payload.into_bytes(), meta()));

    let sent = publisher.wait_for(1, Duration::from_secs(10));
    assert_eq!(sent.len(), 1);
    let reply = &sent[0].0;
    assert_eq!(reply["id"], "g-telnet");
    assert_eq!(reply["code"], 0);
    assert_eq!(reply["cmd"], "show uptime");
    assert_eq!(reply["encoding"], "utf-8");
    assert_eq!(reply["stdout"], "show uptime\r\nuptime 42 days\r\n");
    assert_eq!(reply["returncode"], Value::Null);

    drop(inbox);
    front_door.shutdown();
    dispatcher.context().scheduler.stop();
}

#[test]
fn test_info_task_through_front_door() {
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = Arc::new(dispatcher("it-info", publisher.clone()));
    let mut front_door = FrontDoor::start(dispatcher.clone(), 1).unwrap();
    let inbox = front_door.inbox().unwrap();

    let payload = json!({"id": "i-1", "type": "info", "extra": {"source": "it"}}).to_string();
    inbox.push(payload.into_bytes(), meta());

    let sent = publisher.wait_for(1, Duration::from_secs(5));
    let reply = &sent[0].0;
    assert_eq!(reply["id"], "i-1");
    assert_eq!(reply["type"], "info");
    assert_eq!(reply["extra"]["source"], "it");
    assert_eq!(reply["result"]["version"], "0.1.0-test");

    drop(inbox);
    front_door.shutdown();
    assert_eq!(front_door.backlog(), 0);
    dispatcher.context().scheduler.stop();
}
