//! Serial-console channel to a guest.
//!
//! Wraps the hypervisor child's stdio as a line-oriented pseudo-terminal
//! with three primitives: `expect`, `send`, and `send_line`. Login and
//! command execution are expressed on top of these by the VM controller.
//! The streams are boxed so tests can drive a console with in-memory
//! duplex pipes instead of a real child process.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::error::{QemuError, Result};

/// Prompt shown to the root user once logged in.
pub const ROOT_PROMPT: &str = "# ";
/// Prompt shown to a non-root user once logged in.
pub const USER_PROMPT: &str = "$ ";

const READ_CHUNK: usize = 1024;

/// Pattern-driven expect/send interface over a guest serial console.
pub struct Console {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Output received but not yet consumed by an `expect`
    buf: Vec<u8>,
    /// Output seen before the last matched pattern
    before: String,
    op_timeout: Duration,
}

impl Console {
    /// Build a console over arbitrary stream halves.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        op_timeout: Duration,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            buf: Vec::new(),
            before: String::new(),
            op_timeout,
        }
    }

    /// Output seen since the previous `expect`, up to the last match.
    pub fn before(&self) -> &str {
        &self.before
    }

    /// Default per-operation timeout.
    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Wait until `pattern` appears in the console output, using the
    /// default timeout. Everything preceding the match is stored and
    /// exposed via [`Console::before`]; the match itself is consumed.
    pub async fn expect(&mut self, pattern: &str) -> Result<()> {
        self.expect_timeout(pattern, self.op_timeout).await
    }

    /// Wait until `pattern` appears in the console output.
    pub async fn expect_timeout(&mut self, pattern: &str, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        let needle = pattern.as_bytes();

        loop {
            if let Some(idx) = find(&self.buf, needle) {
                self.before = String::from_utf8_lossy(&self.buf[..idx]).into_owned();
                self.buf.drain(..idx + needle.len());
                trace!(pattern, before = %self.before, "matched console pattern");
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QemuError::PromptTimeout(format!(
                    "'{pattern}' (last output: {:?})",
                    tail(&self.buf)
                ))
                .into());
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = match timeout(remaining, self.reader.read(&mut chunk)).await {
                Ok(read) => read.map_err(|e| QemuError::UnexpectedEof(e.to_string()))?,
                Err(_) => {
                    return Err(QemuError::PromptTimeout(format!(
                        "'{pattern}' (last output: {:?})",
                        tail(&self.buf)
                    ))
                    .into());
                }
            };

            if n == 0 {
                return Err(QemuError::UnexpectedEof(format!(
                    "while expecting '{pattern}'"
                ))
                .into());
            }

            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write raw text to the guest.
    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(text.as_bytes())
            .await
            .map_err(|e| QemuError::UnexpectedEof(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| QemuError::UnexpectedEof(e.to_string()))?;
        Ok(())
    }

    /// Write a line to the guest, terminated with `\n`.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        debug!(line, "console send");
        self.send(line).await?;
        self.send("\n").await
    }

    /// Send a control character, e.g. `send_control('c')` for Ctrl-C.
    pub async fn send_control(&mut self, c: char) -> Result<()> {
        let byte = (c.to_ascii_uppercase() as u8) & 0x1f;
        self.writer
            .write_all(&[byte])
            .await
            .map_err(|e| QemuError::UnexpectedEof(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| QemuError::UnexpectedEof(e.to_string()))?;
        Ok(())
    }

    /// Consume output until the peer closes the stream.
    pub async fn wait_eof(&mut self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QemuError::PromptTimeout("EOF".into()).into());
            }
            match timeout(remaining, self.reader.read(&mut chunk)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => return Ok(()),
                Err(_) => return Err(QemuError::PromptTimeout("EOF".into()).into()),
            }
        }
    }

    /// Drive the login state machine: wait for the login prompt, send the
    /// username, answer the password prompt, and wait for `user_prompt`.
    pub async fn login(
        &mut self,
        login_prompt: &str,
        user: &str,
        passwd: &str,
        user_prompt: &str,
    ) -> Result<()> {
        debug!("waiting for login prompt");
        self.expect(login_prompt)
            .await
            .map_err(|e| QemuError::LoginFailed(format!("no login prompt: {e}")))?;

        debug!("sending user");
        self.send_line(user).await?;
        self.expect("Password:")
            .await
            .map_err(|e| QemuError::LoginFailed(format!("no password prompt: {e}")))?;

        debug!("sending password");
        self.send_line(passwd).await?;
        self.expect(user_prompt)
            .await
            .map_err(|_| QemuError::LoginFailed(format!("got '{}'", self.before())))?;

        Ok(())
    }
}

/// Select the shell prompt that follows a successful login.
pub fn prompt_for_user(user: &str) -> &'static str {
    if user == "root" {
        ROOT_PROMPT
    } else {
        USER_PROMPT
    }
}

/// Parse the integer exit code out of the output of `echo $?`.
///
/// The first line is the echoed command itself; the code is on the
/// second line.
pub fn parse_exit_code(before: &str) -> Result<i32> {
    before
        .lines()
        .nth(1)
        .map(|l| l.trim())
        .and_then(|l| l.parse::<i32>().ok())
        .ok_or_else(|| QemuError::ExitParse(before.to_string()).into())
}

/// Strip the echoed command line from raw command output and trim.
pub fn strip_echo(raw: &str, cmd: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.strip_prefix(cmd) {
        Some(rest) => rest.trim_start_matches(['\r', '\n']).trim().to_string(),
        None => trimmed.to_string(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// Last chunk of pending output, for timeout diagnostics.
fn tail(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(128);
    String::from_utf8_lossy(&buf[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_on_second_line() {
        assert_eq!(parse_exit_code("echo $?\r\r\n0\r\r\n").unwrap(), 0);
        assert_eq!(parse_exit_code("echo $?\r\n127\r\n").unwrap(), 127);
    }

    #[test]
    fn exit_code_parse_failure() {
        assert!(parse_exit_code("echo $?").is_err());
        assert!(parse_exit_code("echo $?\r\r\nnot-a-number\r\r\n").is_err());
    }

    #[test]
    fn echoed_command_is_stripped() {
        let raw = "ls /tmp\r\r\nsample.bin\r\nlost+found";
        assert_eq!(strip_echo(raw, "ls /tmp"), "sample.bin\r\nlost+found");
    }

    #[test]
    fn output_without_echo_is_trimmed_only() {
        assert_eq!(strip_echo("  hello\r\n", "ls"), "hello");
    }

    #[test]
    fn prompt_selection() {
        assert_eq!(prompt_for_user("root"), ROOT_PROMPT);
        assert_eq!(prompt_for_user("iot"), USER_PROMPT);
    }

    #[tokio::test]
    async fn expect_consumes_match_and_saves_before() {
        let (client, mut server) = tokio::io::duplex(256);
        let (r, w) = tokio::io::split(client);
        let mut console = Console::new(r, w, Duration::from_secs(1));

        use tokio::io::AsyncWriteExt;
        server.write_all(b"boot noise\nsandbox login: ").await.unwrap();

        console.expect("sandbox login: ").await.unwrap();
        assert_eq!(console.before(), "boot noise\n");
    }

    #[tokio::test]
    async fn expect_times_out() {
        let (client, _server) = tokio::io::duplex(256);
        let (r, w) = tokio::io::split(client);
        let mut console = Console::new(r, w, Duration::from_millis(50));

        let err = console.expect("never").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Qemu(QemuError::PromptTimeout(_))
        ));
    }
}
