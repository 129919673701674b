//! Out-of-band monitor channel to the hypervisor.
//!
//! Two mutually exclusive backends expose the same contract:
//!
//! - **JSON (QMP):** a TCP socket the hypervisor listens on. Requests are
//!   compact JSON objects `{"execute": op, "arguments": {...}}`; replies
//!   arrive line-delimited and the first object carrying a `return` key
//!   is the result. Asynchronous event objects are discarded.
//! - **Text:** the human monitor multiplexed onto the serial console
//!   behind the Ctrl-A escape. Because the console is shared with the
//!   guest OS, the text backend must never run while a guest command is
//!   in flight; the VM controller enforces that.
//!
//! Only the operations the harness needs are whitelisted; anything else
//! is refused before it reaches the wire.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::console::Console;
use crate::error::{QemuError, Result};

/// Monitor operations the harness supports.
pub const SUPPORTED_OPS: [&str; 4] = ["quit", "loadvm", "savevm", "qmp_capabilities"];

/// Host the hypervisor binds its QMP server to.
pub const QMP_HOST: &str = "127.0.0.1";

/// Prompt printed by the textual monitor.
pub const TEXT_MONITOR_PROMPT: &str = "(qemu)";

// Upper bound on reply objects consumed per request before giving up;
// everything before the `return` object is an event.
const MAX_REPLY_OBJECTS: usize = 32;

/// A monitor command that can be sent to the hypervisor.
#[derive(Debug, Clone, Serialize)]
pub struct QmpCommand {
    execute: String,
    arguments: serde_json::Map<String, Value>,
}

impl QmpCommand {
    /// Build an arbitrary command. Whitelist enforcement happens at send
    /// time so unsupported operations surface as a typed error.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            execute: op.into(),
            arguments: serde_json::Map::new(),
        }
    }

    /// Attach an argument to the command.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn quit() -> Self {
        Self::new("quit")
    }

    pub fn loadvm(tag: &str) -> Self {
        Self::new("loadvm").arg("tag", tag)
    }

    pub fn savevm(tag: &str) -> Self {
        Self::new("savevm").arg("tag", tag)
    }

    pub fn capabilities() -> Self {
        Self::new("qmp_capabilities")
    }

    /// The operation name.
    pub fn op(&self) -> &str {
        &self.execute
    }

    /// Whether the operation is inside the supported whitelist.
    pub fn supported(&self) -> bool {
        SUPPORTED_OPS.contains(&self.execute.as_str())
    }
}

/// A reply is a success iff it maps `return` to an empty object or array.
pub fn reply_indicates_success(reply: &Value) -> bool {
    match reply.get("return") {
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

/// JSON monitor backend over the hypervisor's QMP TCP socket.
#[derive(Debug)]
pub struct QmpMonitor {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    greeting: Value,
    op_timeout: Duration,
}

impl QmpMonitor {
    /// Connect to the QMP server, consume the greeting, and leave
    /// capabilities negotiation by issuing `qmp_capabilities`.
    pub async fn connect(port: u16, op_timeout: Duration) -> Result<Self> {
        let stream = timeout(op_timeout, TcpStream::connect((QMP_HOST, port)))
            .await
            .map_err(|_| QemuError::MonitorHandshake("connect timed out".into()))?
            .map_err(|e| QemuError::MonitorHandshake(format!("connect failed: {e}")))?;

        let (read_half, writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        timeout(op_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| QemuError::MonitorHandshake("no greeting".into()))?
            .map_err(|e| QemuError::MonitorHandshake(format!("greeting read failed: {e}")))?;

        let greeting: Value = serde_json::from_str(line.trim())
            .map_err(|e| QemuError::MonitorHandshake(format!("malformed greeting: {e}")))?;
        debug!(%greeting, "QMP greeting received");

        let mut monitor = Self {
            reader,
            writer,
            greeting,
            op_timeout,
        };

        monitor
            .execute(QmpCommand::capabilities())
            .await
            .map_err(|e| QemuError::MonitorHandshake(format!("capabilities: {e}")))?;

        Ok(monitor)
    }

    /// The greeting object the server sent on connect.
    pub fn greeting(&self) -> &Value {
        &self.greeting
    }

    /// Send one command and return the first reply carrying `return`.
    /// Event objects interleaved in the stream are discarded.
    pub async fn execute(&mut self, cmd: QmpCommand) -> Result<Value> {
        if !cmd.supported() {
            return Err(QemuError::UnsupportedMonitorOp(cmd.op().to_string()).into());
        }

        debug!(op = cmd.op(), "sending QMP command");
        let mut payload = serde_json::to_string(&cmd)?;
        payload.push('\n');
        self.writer
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| QemuError::Monitor(format!("send failed: {e}")))?;

        for _ in 0..MAX_REPLY_OBJECTS {
            let mut line = String::new();
            let n = timeout(self.op_timeout, self.reader.read_line(&mut line))
                .await
                .map_err(|_| QemuError::Monitor(format!("no reply to '{}'", cmd.op())))?
                .map_err(|e| QemuError::Monitor(format!("recv failed: {e}")))?;

            if n == 0 {
                return Err(QemuError::Monitor("connection closed by hypervisor".into()).into());
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let reply: Value = serde_json::from_str(trimmed)
                .map_err(|e| QemuError::Monitor(format!("malformed reply: {e}")))?;

            if reply.get("return").is_some() {
                return Ok(reply);
            }
            trace!(%reply, "discarding QMP event");
        }

        Err(QemuError::Monitor(format!("no return reply to '{}'", cmd.op())).into())
    }

    /// Close the monitor socket.
    pub async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Switch the shared console into monitor mode.
pub(crate) async fn enter_text_monitor(console: &mut Console) -> Result<()> {
    console.send_control('a').await?;
    console.send("c").await?;
    console.expect(TEXT_MONITOR_PROMPT).await.map_err(|_| {
        QemuError::Monitor("did not receive text monitor prompt".into()).into()
    })
}

/// Switch the shared console back to the guest OS.
pub(crate) async fn exit_text_monitor(console: &mut Console, user_prompt: &str) -> Result<()> {
    console.send_control('a').await?;
    // The newline elicits the shell prompt so we can confirm the switch.
    console.send_line("c").await?;
    console.expect(user_prompt).await.map_err(|_| {
        QemuError::Monitor("guest prompt did not reappear after monitor exit".into()).into()
    })
}

/// Run one textual monitor command and return to the guest OS.
pub(crate) async fn text_monitor_command(
    console: &mut Console,
    user_prompt: &str,
    op: &str,
    args: &[&str],
) -> Result<()> {
    if !SUPPORTED_OPS.contains(&op) {
        return Err(QemuError::UnsupportedMonitorOp(op.to_string()).into());
    }

    debug!(op, ?args, "sending text monitor command");
    let line = if args.is_empty() {
        op.to_string()
    } else {
        format!("{op} {}", args.join(" "))
    };

    enter_text_monitor(console).await?;
    console.send_line(&line).await?;
    console.expect(TEXT_MONITOR_PROMPT).await.map_err(|_| {
        QemuError::Monitor(format!("no monitor prompt after '{op}'"))
    })?;
    exit_text_monitor(console, user_prompt).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whitelist_accepts_known_ops() {
        assert!(QmpCommand::quit().supported());
        assert!(QmpCommand::loadvm("clean").supported());
        assert!(QmpCommand::savevm("clean").supported());
        assert!(QmpCommand::capabilities().supported());
    }

    #[test]
    fn whitelist_rejects_unknown_ops() {
        assert!(!QmpCommand::new("system_reset").supported());
        assert!(!QmpCommand::new("migrate").supported());
    }

    #[test]
    fn command_serializes_to_execute_arguments() {
        let cmd = QmpCommand::savevm("clean");
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["execute"], "savevm");
        assert_eq!(v["arguments"]["tag"], "clean");
    }

    #[test]
    fn empty_return_means_success() {
        assert!(reply_indicates_success(&json!({"return": {}})));
        assert!(reply_indicates_success(&json!({"return": []})));
    }

    #[test]
    fn non_empty_or_missing_return_is_not_success() {
        assert!(!reply_indicates_success(&json!({"return": {"status": "running"}})));
        assert!(!reply_indicates_success(&json!({"error": {"class": "GenericError"}})));
        assert!(!reply_indicates_success(&json!({"event": "SHUTDOWN"})));
    }
}
