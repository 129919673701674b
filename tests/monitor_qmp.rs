//! JSON monitor tests against an in-process mock QMP server.
//!
//! The mock speaks just enough of the wire protocol: a greeting on
//! connect, capability negotiation, line-delimited command replies, and
//! interleaved event objects that the client must skip.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use cinderbox::error::{Error, QemuError};
use cinderbox::vm::monitor::{reply_indicates_success, QmpCommand, QmpMonitor};

const GREETING: &str =
    r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 7}}, "capabilities": []}}"#;

/// Accept one connection and answer commands until `quit`.
async fn run_mock_qmp(listener: TcpListener, events_before_reply: usize) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(format!("{GREETING}\n").as_bytes())
        .await
        .unwrap();

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.unwrap();
        if n == 0 {
            return;
        }

        let request: Value = serde_json::from_str(line.trim()).unwrap();
        let op = request["execute"].as_str().unwrap().to_string();

        for i in 0..events_before_reply {
            let event = format!(r#"{{"event": "NOISE_{i}", "timestamp": {{}}}}"#);
            write_half
                .write_all(format!("{event}\n").as_bytes())
                .await
                .unwrap();
        }

        match op.as_str() {
            "qmp_capabilities" | "savevm" | "loadvm" => {
                write_half.write_all(b"{\"return\": {}}\n").await.unwrap();
            }
            "quit" => {
                write_half.write_all(b"{\"return\": {}}\n").await.unwrap();
                return;
            }
            _ => {
                write_half
                    .write_all(
                        b"{\"error\": {\"class\": \"CommandNotFound\", \"desc\": \"nope\"}}\n",
                    )
                    .await
                    .unwrap();
            }
        }
    }
}

async fn start_mock(events_before_reply: usize) -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(run_mock_qmp(listener, events_before_reply));
    (port, server)
}

#[tokio::test]
async fn handshake_negotiates_capabilities() {
    let (port, server) = start_mock(0).await;
    let monitor = QmpMonitor::connect(port, std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert!(monitor.greeting().get("QMP").is_some());

    drop(monitor);
    server.abort();
}

#[tokio::test]
async fn savevm_round_trips_and_reports_success() {
    let (port, server) = start_mock(0).await;
    let mut monitor = QmpMonitor::connect(port, std::time::Duration::from_secs(5))
        .await
        .unwrap();

    let reply = monitor.execute(QmpCommand::savevm("clean")).await.unwrap();
    assert!(reply_indicates_success(&reply));

    let reply = monitor.execute(QmpCommand::quit()).await.unwrap();
    assert!(reply_indicates_success(&reply));
    server.await.unwrap();
}

#[tokio::test]
async fn events_are_discarded_until_the_return_reply() {
    let (port, server) = start_mock(3).await;
    let mut monitor = QmpMonitor::connect(port, std::time::Duration::from_secs(5))
        .await
        .unwrap();

    let reply = monitor.execute(QmpCommand::loadvm("clean")).await.unwrap();
    assert!(reply_indicates_success(&reply));
    assert!(reply.get("event").is_none());

    monitor.execute(QmpCommand::quit()).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn unsupported_op_is_refused_before_the_wire() {
    let (port, server) = start_mock(0).await;
    let mut monitor = QmpMonitor::connect(port, std::time::Duration::from_secs(5))
        .await
        .unwrap();

    let err = monitor
        .execute(QmpCommand::new("system_powerdown"))
        .await
        .unwrap_err();
    match err {
        Error::Qemu(QemuError::UnsupportedMonitorOp(op)) => {
            assert_eq!(op, "system_powerdown");
        }
        other => panic!("expected UnsupportedMonitorOp, got {other:?}"),
    }

    // The monitor is still usable afterwards.
    monitor.execute(QmpCommand::quit()).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn connect_fails_cleanly_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = QmpMonitor::connect(port, std::time::Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Qemu(QemuError::MonitorHandshake(_))
    ));
}
