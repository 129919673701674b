//! Authenticated remote-shell channel to a guest.
//!
//! An alternative to the serial console for command execution on guests
//! that run an SSH daemon. The backing library is blocking, so every
//! operation runs under `spawn_blocking`; asynchronous jobs are plain
//! `JoinHandle`s over the same path.
//!
//! The library offers no way to interrupt a command running on an open
//! channel, so cancellation works by opening a second session and
//! delivering `pkill -SIGINT <prog>`; the caller must supply the program
//! name.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use ssh2::Session;
use tokio::task::{spawn_blocking, JoinHandle};
use tracing::debug;

use super::CmdResult;
use crate::error::{QemuError, Result};

/// An in-flight remote command; `join` through the VM controller's
/// `wait_existing` to reap it.
pub struct ShellJob {
    pub(crate) handle: JoinHandle<Result<CmdResult>>,
}

/// A password-authenticated shell session to a guest's network address.
pub struct RemoteShell {
    host: String,
    port: u16,
    user: String,
    passwd: String,
    session: Arc<Mutex<Session>>,
}

impl RemoteShell {
    /// Connect and authenticate against `host:port`.
    pub async fn connect(host: &str, port: u16, user: &str, passwd: &str) -> Result<Self> {
        let (host, user, passwd) = (host.to_string(), user.to_string(), passwd.to_string());
        let (h, u, p) = (host.clone(), user.clone(), passwd.clone());

        let session = spawn_blocking(move || open_session(&h, port, &u, &p))
            .await
            .map_err(|e| QemuError::Shell(format!("connect task failed: {e}")))??;

        debug!(host, port, "remote shell established");
        Ok(Self {
            host,
            port,
            user,
            passwd,
            session: Arc::new(Mutex::new(session)),
        })
    }

    /// Run `cmd` to completion and return its result.
    ///
    /// A non-zero exit status is not an error; the result carries stdout
    /// on success and stderr on failure, as the console channel does.
    pub async fn run(&self, cmd: &str) -> Result<CmdResult> {
        self.spawn(cmd).handle
            .await
            .map_err(|e| QemuError::Shell(format!("command task failed: {e}")))?
    }

    /// Start `cmd` without waiting for completion.
    pub fn spawn(&self, cmd: &str) -> ShellJob {
        debug!(cmd, "spawning remote command");
        let session = Arc::clone(&self.session);
        let cmd = cmd.to_string();
        let handle = spawn_blocking(move || {
            let session = session
                .lock()
                .map_err(|_| QemuError::Shell("session lock poisoned".into()))?;
            exec_blocking(&session, &cmd)
        });
        ShellJob { handle }
    }

    /// Deliver SIGINT to `prog` in the guest over a second session.
    pub async fn interrupt(&self, prog: &str) -> Result<()> {
        debug!(prog, "interrupting remote program");
        let (host, user, passwd) = (
            self.host.clone(),
            self.user.clone(),
            self.passwd.clone(),
        );
        let port = self.port;
        let prog = prog.to_string();
        let prog_for_task = prog.clone();

        let result = spawn_blocking(move || {
            let session = open_session(&host, port, &user, &passwd)?;
            exec_blocking(&session, &format!("sudo pkill -SIGINT {prog_for_task}"))
        })
        .await
        .map_err(|e| QemuError::Shell(format!("interrupt task failed: {e}")))??;

        if result.exitcode != 0 {
            return Err(
                QemuError::Shell(format!("failed to terminate program '{prog}'")).into(),
            );
        }
        Ok(())
    }

    /// Drop the underlying TCP session.
    pub async fn close(self) {
        let session = Arc::clone(&self.session);
        let _ = spawn_blocking(move || {
            if let Ok(session) = session.lock() {
                let _ = session.disconnect(None, "shutting down", None);
            }
        })
        .await;
    }
}

fn open_session(host: &str, port: u16, user: &str, passwd: &str) -> Result<Session> {
    let tcp = TcpStream::connect((host, port))
        .map_err(|e| QemuError::Shell(format!("tcp connect to {host}:{port} failed: {e}")))?;

    let mut session =
        Session::new().map_err(|e| QemuError::Shell(format!("session init failed: {e}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| QemuError::Shell(format!("ssh handshake failed: {e}")))?;
    session
        .userauth_password(user, passwd)
        .map_err(|e| QemuError::Shell(format!("authentication failed: {e}")))?;

    Ok(session)
}

fn exec_blocking(session: &Session, cmd: &str) -> Result<CmdResult> {
    use std::io::Read;

    let mut channel = session
        .channel_session()
        .map_err(|e| QemuError::Shell(format!("channel open failed: {e}")))?;
    channel
        .exec(cmd)
        .map_err(|e| QemuError::Shell(format!("exec failed: {e}")))?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| QemuError::Shell(format!("stdout read failed: {e}")))?;

    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| QemuError::Shell(format!("stderr read failed: {e}")))?;

    channel
        .wait_close()
        .map_err(|e| QemuError::Shell(format!("channel close failed: {e}")))?;
    let exitcode = channel
        .exit_status()
        .map_err(|e| QemuError::Shell(format!("exit status unavailable: {e}")))?;

    let output = if exitcode == 0 { stdout } else { stderr };
    Ok(CmdResult {
        exitcode,
        output: output.trim().to_string(),
    })
}
