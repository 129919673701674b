//! VM controller driving a QEMU guest.
//!
//! A [`VmController`] owns one hypervisor child process and the control
//! channels into it:
//!
//! - the serial **console** ([`console::Console`]) for login and command
//!   execution,
//! - an optional **remote shell** ([`shell::RemoteShell`]) as the command
//!   channel for guests that run an SSH daemon,
//! - exactly one **monitor** backend ([`monitor`]) for snapshot, restore,
//!   and shutdown: the QMP socket when the configuration enables it, the
//!   text monitor multiplexed on the console otherwise.
//!
//! All operations go through `&mut self`, so API calls on one controller
//! are serialized by construction. Commands may be run synchronously or
//! started asynchronously and reaped later; at most one command is in
//! flight per controller at any time.

pub mod console;
pub mod monitor;
pub mod shell;

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::arch::Arch;
use crate::config::VmConfig;
use crate::error::{QemuError, Result};

use self::console::{parse_exit_code, prompt_for_user, strip_echo, Console};
use self::monitor::{
    enter_text_monitor, reply_indicates_success, text_monitor_command, QmpCommand, QmpMonitor,
};
use self::shell::{RemoteShell, ShellJob};

// Give the hypervisor a moment to bring up its QMP server before we
// connect to it.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Result of a command run on a guest VM.
///
/// Not constructed directly; returned by waiting on commands. Carries
/// stdout when the command succeeded and stderr when it failed.
#[derive(Debug, Clone)]
pub struct CmdResult {
    pub exitcode: i32,
    pub output: String,
}

impl CmdResult {
    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exitcode == 0
    }
}

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Uninit,
    Running,
    Stopped,
}

/// The command in flight on a controller, if any.
///
/// At most one command runs at a time; a second `run` before the first
/// is reaped is a programmer error.
enum Awaiting {
    Idle,
    /// Command sent on the console; the string is the echoed command line
    Console(String),
    /// Command running over the remote shell
    Remote(ShellJob),
}

impl Awaiting {
    fn is_idle(&self) -> bool {
        matches!(self, Awaiting::Idle)
    }
}

/// Controller for one QEMU guest: spawn, login, run commands, snapshot,
/// restore, stop.
pub struct VmController {
    config: VmConfig,
    state: VmState,
    child: Option<Child>,
    console: Option<Console>,
    /// JSON monitor; present iff the config selects QMP and the VM runs
    qmp: Option<QmpMonitor>,
    /// Remote-shell command channel; present iff started with one
    shell: Option<RemoteShell>,
    awaiting: Awaiting,
    user_prompt: &'static str,
}

impl VmController {
    pub fn new(config: VmConfig) -> Self {
        let user_prompt = prompt_for_user(&config.user);
        Self {
            config,
            state: VmState::Uninit,
            child: None,
            console: None,
            qmp: None,
            shell: None,
            awaiting: Awaiting::Idle,
            user_prompt,
        }
    }

    pub fn arch(&self) -> Arch {
        self.config.arch
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == VmState::Running
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Whether snapshot/reset must happen against the disk image while
    /// the VM is stopped.
    pub fn needs_offline_snapshot(&self) -> bool {
        self.config.arch.needs_offline_snapshot()
    }

    /// Start the guest for automated control.
    ///
    /// With `remote = None` the controller logs in on the serial console
    /// and runs commands there. With `remote = Some((host, port))` it
    /// waits for the guest to boot, then opens an authenticated shell to
    /// that address and routes commands through it.
    pub async fn start_noninteractive(&mut self, remote: Option<(String, u16)>) -> Result<()> {
        if self.state == VmState::Running {
            return Err(QemuError::AlreadyRunning.into());
        }

        let binary = self.config.arch.qemu_binary();
        let mut args = self.config.arch.qemu_args(
            &self.config.image_dir,
            &self.config.nic_helper,
            &self.config.mac_addr,
        );
        args.extend(self.additional_args()?);

        info!(arch = %self.config.arch, %binary, "starting hypervisor");
        debug!(?args, "hypervisor command line");

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| QemuError::Spawn(format!("{binary}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| QemuError::Spawn("hypervisor stdout not captured".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| QemuError::Spawn("hypervisor stdin not captured".into()))?;

        self.child = Some(child);
        self.console = Some(Console::new(stdout, stdin, self.config.timeout));

        tokio::time::sleep(STARTUP_GRACE).await;

        if self.config.use_qmp {
            let port = match self.config.qmp_port {
                Some(p) => p,
                None => {
                    self.abort_start().await;
                    return Err(QemuError::MonitorHandshake(
                        "QMP enabled but no monitor port configured".into(),
                    )
                    .into());
                }
            };
            match QmpMonitor::connect(port, self.config.timeout).await {
                Ok(m) => self.qmp = Some(m),
                Err(e) => {
                    self.abort_start().await;
                    return Err(e);
                }
            }
        }

        match remote {
            None => {
                debug!("attempting console login");
                let login_prompt = self.config.login_prompt.clone();
                let (user, passwd) = (self.config.user.clone(), self.config.passwd.clone());
                let prompt = self.user_prompt;
                let console = self.console_mut()?;
                if let Err(e) = console.login(&login_prompt, &user, &passwd, prompt).await {
                    self.abort_start().await;
                    return Err(e);
                }
            }
            Some((host, port)) => {
                debug!(%host, port, "waiting for boot before opening remote shell");
                let login_prompt = self.config.login_prompt.clone();
                let console = self.console_mut()?;
                if let Err(e) = console.expect(&login_prompt).await {
                    self.abort_start().await;
                    return Err(QemuError::LoginFailed(format!("no login prompt: {e}")).into());
                }
                match RemoteShell::connect(&host, port, &self.config.user, &self.config.passwd)
                    .await
                {
                    Ok(s) => self.shell = Some(s),
                    Err(e) => {
                        self.abort_start().await;
                        return Err(e);
                    }
                }
            }
        }

        self.state = VmState::Running;
        Ok(())
    }

    /// Run a command on the guest.
    ///
    /// With `wait = true` the command is reaped immediately and its
    /// [`CmdResult`] returned. With `wait = false` the call returns
    /// `None` and the command must later be reaped with exactly one
    /// [`VmController::wait_existing`] or
    /// [`VmController::terminate_existing`].
    pub async fn run(&mut self, cmd: &str, wait: bool) -> Result<Option<CmdResult>> {
        if self.state != VmState::Running {
            return Err(QemuError::NotStarted.into());
        }
        if !self.awaiting.is_idle() {
            return Err(QemuError::AwaitingAlreadySet.into());
        }

        debug!(cmd, wait, "running guest command");
        if let Some(shell) = &self.shell {
            self.awaiting = Awaiting::Remote(shell.spawn(cmd));
        } else {
            let console = self.console_mut()?;
            console.send_line(cmd).await?;
            self.awaiting = Awaiting::Console(cmd.to_string());
        }

        if wait {
            self.wait_existing().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reap the command currently in flight.
    pub async fn wait_existing(&mut self) -> Result<CmdResult> {
        match std::mem::replace(&mut self.awaiting, Awaiting::Idle) {
            Awaiting::Idle => Err(QemuError::NoCommandInFlight.into()),
            Awaiting::Console(cmd) => {
                let prompt = self.user_prompt;
                let console = self.console_mut()?;

                // The prompt reappearing confirms command completion.
                console.expect(prompt).await?;
                let raw = console.before().to_string();

                console.send_line("echo $?").await?;
                console.expect(prompt).await?;
                let exitcode = parse_exit_code(console.before())?;

                let output = strip_echo(&raw, &cmd);
                debug!(exitcode, "guest command completed");
                Ok(CmdResult { exitcode, output })
            }
            Awaiting::Remote(job) => {
                let result = job
                    .handle
                    .await
                    .map_err(|e| QemuError::Shell(format!("command task failed: {e}")))??;
                debug!(exitcode = result.exitcode, "remote command completed");
                Ok(result)
            }
        }
    }

    /// Interrupt the command currently in flight and reap its result.
    ///
    /// On the console channel this delivers Ctrl-C to the guest's
    /// foreground process. On the remote-shell channel the backing
    /// library cannot interrupt locally, so `prog` is required and the
    /// interrupt is delivered as `pkill -SIGINT <prog>` over a second
    /// session.
    pub async fn terminate_existing(&mut self, prog: Option<&str>) -> Result<CmdResult> {
        match self.awaiting {
            Awaiting::Idle => return Err(QemuError::NoCommandInFlight.into()),
            Awaiting::Console(_) => {
                self.console_mut()?.send_control('c').await?;
            }
            Awaiting::Remote(_) => {
                let prog = prog.ok_or(QemuError::PkillRequiresProg)?;
                let shell = self
                    .shell
                    .as_ref()
                    .ok_or_else(|| QemuError::Shell("remote shell not connected".into()))?;
                shell.interrupt(prog).await?;
            }
        }
        self.wait_existing().await
    }

    /// Save the live guest state under `tag` via the monitor.
    pub async fn snapshot(&mut self, tag: &str) -> Result<()> {
        debug!(tag, "taking live snapshot");
        self.live_snapshot_op("savevm", tag).await
    }

    /// Revert the live guest state to the snapshot named `tag`.
    pub async fn reset(&mut self, tag: &str) -> Result<()> {
        debug!(tag, "resetting to snapshot");
        self.live_snapshot_op("loadvm", tag).await
    }

    async fn live_snapshot_op(&mut self, op: &str, tag: &str) -> Result<()> {
        if self.state != VmState::Running {
            return Err(QemuError::NotStarted.into());
        }
        if self.needs_offline_snapshot() {
            return Err(QemuError::OfflineOnlyArch(self.config.arch).into());
        }

        if let Some(qmp) = self.qmp.as_mut() {
            let cmd = match op {
                "savevm" => QmpCommand::savevm(tag),
                _ => QmpCommand::loadvm(tag),
            };
            let reply = qmp.execute(cmd).await?;
            if !reply_indicates_success(&reply) {
                return Err(
                    QemuError::Monitor(format!("'{op}' rejected: {reply}")).into(),
                );
            }
            Ok(())
        } else {
            // The text monitor rides on the console; an in-flight guest
            // command would corrupt both streams.
            if !self.awaiting.is_idle() {
                return Err(QemuError::ConsoleBusy.into());
            }
            let prompt = self.user_prompt;
            let console = self.console_mut()?;
            text_monitor_command(console, prompt, op, &[tag]).await
        }
    }

    /// Snapshot the on-disk image under `tag` while the VM is stopped.
    ///
    /// Required for guests whose architecture cannot snapshot live.
    pub async fn offline_snapshot(&mut self, tag: &str) -> Result<()> {
        debug!(tag, image = %self.config.image_dir.display(), "offline snapshot");
        self.image_snapshot_op("-c", tag).await
    }

    /// Revert the on-disk image to `tag` while the VM is stopped.
    pub async fn offline_reset(&mut self, tag: &str) -> Result<()> {
        debug!(tag, image = %self.config.image_dir.display(), "offline reset");
        self.image_snapshot_op("-a", tag).await
    }

    async fn image_snapshot_op(&mut self, action: &str, tag: &str) -> Result<()> {
        if self.state == VmState::Running {
            return Err(QemuError::StillRunning.into());
        }

        let image = self.config.image_dir.join("rootfs.qcow2");
        let output = Command::new("qemu-img")
            .arg("snapshot")
            .arg(action)
            .arg(tag)
            .arg(&image)
            .output()
            .await
            .map_err(|e| QemuError::ImageTool(format!("spawn failed: {e}")))?;

        if !output.status.success() {
            return Err(QemuError::ImageTool(format!(
                "{} on {}: {}",
                action,
                image.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(())
    }

    /// Stop the VM via the monitor and reap the hypervisor process.
    ///
    /// Refuses to stop while a command is in flight unless `force` is
    /// set. Stopping a VM that never started is a no-op.
    pub async fn stop(&mut self, force: bool) -> Result<()> {
        if self.state != VmState::Running {
            debug!("hypervisor not running, nothing to stop");
            return Ok(());
        }

        if !self.awaiting.is_idle() {
            if !force {
                return Err(QemuError::AwaitingBlocksStop.into());
            }
            // A forced stop abandons the in-flight command.
            if let Awaiting::Remote(job) = std::mem::replace(&mut self.awaiting, Awaiting::Idle) {
                job.handle.abort();
            }
            warn!("forced stop with a command in flight");
        }

        if let Some(shell) = self.shell.take() {
            shell.close().await;
        }

        if let Some(mut qmp) = self.qmp.take() {
            let reply = qmp.execute(QmpCommand::quit()).await?;
            if !reply_indicates_success(&reply) {
                return Err(QemuError::Monitor(format!(
                    "did not quit, hypervisor replied {reply}"
                ))
                .into());
            }
            qmp.shutdown().await;
        } else {
            let console = self.console_mut()?;
            enter_text_monitor(console).await?;
            console.send_line("quit").await?;
        }

        // Both monitor paths drain the console to end-of-stream and reap
        // the child before reporting the VM stopped.
        let limit = self.config.timeout;
        if let Some(console) = self.console.as_mut() {
            if let Err(e) = console.wait_eof(limit).await {
                warn!("console did not reach EOF: {e}");
            }
        }

        if let Some(mut child) = self.child.take() {
            match timeout(limit, child.wait()).await {
                Ok(Ok(status)) => debug!(?status, "hypervisor exited"),
                Ok(Err(e)) => warn!("failed to reap hypervisor: {e}"),
                Err(_) => {
                    warn!("hypervisor did not exit in time, killing it");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.console = None;
        self.awaiting = Awaiting::Idle;
        self.state = VmState::Stopped;
        Ok(())
    }

    // Best-effort cleanup for a start that failed partway.
    async fn abort_start(&mut self) {
        if let Some(qmp) = self.qmp.take() {
            qmp.shutdown().await;
        }
        self.console = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.state = VmState::Uninit;
    }

    fn console_mut(&mut self) -> Result<&mut Console> {
        self.console
            .as_mut()
            .ok_or_else(|| QemuError::NotStarted.into())
    }

    // Flags appended after the per-architecture profile; the monitor mode
    // decides how the serial console and monitor share the host streams.
    fn additional_args(&self) -> Result<Vec<String>> {
        if self.config.use_qmp {
            let port = self.config.qmp_port.ok_or_else(|| {
                QemuError::MonitorHandshake("QMP enabled but no monitor port configured".into())
            })?;
            Ok(vec![
                "-nographic".into(),
                "-serial".into(),
                "stdio".into(),
                "-qmp".into(),
                format!("tcp:{}:{port},server,wait=off", monitor::QMP_HOST),
            ])
        } else {
            Ok(vec![
                "-nographic".into(),
                "-serial".into(),
                "mon:stdio".into(),
            ])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use std::path::PathBuf;

    fn test_config(arch: Arch, use_qmp: bool) -> VmConfig {
        VmConfig {
            arch,
            user: "root".into(),
            passwd: "toor".into(),
            image_dir: PathBuf::from("/vms/test"),
            nic_helper: "/usr/lib/qemu-bridge-helper".into(),
            mac_addr: "52:54:00:00:00:01".into(),
            login_prompt: "sandbox login: ".into(),
            ip_addr: "192.168.0.20".into(),
            ssh_port: None,
            use_ssh: false,
            qmp_port: if use_qmp { Some(4444) } else { None },
            use_qmp,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn run_requires_started_vm() {
        let mut vm = VmController::new(test_config(Arch::Arm, false));
        let err = vm.run("ls", true).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Qemu(QemuError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn wait_without_command_errors() {
        let mut vm = VmController::new(test_config(Arch::Arm, false));
        let err = vm.wait_existing().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Qemu(QemuError::NoCommandInFlight)
        ));
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let mut vm = VmController::new(test_config(Arch::Arm, true));
        assert!(vm.stop(false).await.is_ok());
        assert_eq!(vm.state(), VmState::Uninit);
    }

    #[tokio::test]
    async fn offline_ops_rejected_while_marked_running() {
        let mut vm = VmController::new(test_config(Arch::Mips, false));
        vm.state = VmState::Running;
        let err = vm.offline_snapshot("clean").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Qemu(QemuError::StillRunning)
        ));
    }

    #[tokio::test]
    async fn live_snapshot_rejected_for_offline_archs() {
        let mut vm = VmController::new(test_config(Arch::Mipsel, false));
        vm.state = VmState::Running;
        let err = vm.snapshot("clean").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Qemu(QemuError::OfflineOnlyArch(Arch::Mipsel))
        ));
    }

    #[test]
    fn qmp_mode_appends_monitor_socket_flag() {
        let vm = VmController::new(test_config(Arch::Cnc, true));
        let args = vm.additional_args().unwrap();
        assert!(args.iter().any(|a| a.starts_with("tcp:127.0.0.1:4444")));
        assert!(args.contains(&"stdio".to_string()));
    }

    #[test]
    fn text_mode_multiplexes_monitor_on_serial() {
        let vm = VmController::new(test_config(Arch::Arm, false));
        let args = vm.additional_args().unwrap();
        assert!(args.contains(&"mon:stdio".to_string()));
    }
}
