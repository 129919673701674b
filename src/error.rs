//! Error types for cinderbox

use thiserror::Error;

use crate::arch::Arch;
use crate::vm::CmdResult;

/// Result type alias using the cinderbox [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a detonation.
///
/// Commands that exit with a non-zero code are not errors by themselves;
/// they come back as a [`CmdResult`] with a non-zero exit code. The
/// [`Error::UnexpectedExit`] variant is reserved for commands the harness
/// requires to succeed.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration; raised before any side effect
    #[error("configuration error: {0}")]
    Config(String),

    /// Error condition in the VM controller or the hypervisor it drives
    #[error(transparent)]
    Qemu(#[from] QemuError),

    /// A privileged network command failed during setup
    #[error("network error: {0}")]
    Net(String),

    /// The in-guest transfer server rejected a command
    #[error("transfer server error: [{code}] {message}")]
    TransferServer { code: u16, message: &'static str },

    /// Malformed welcome, unexpected response shape, or connection reset
    /// on the transfer control/data channels
    #[error("transfer protocol error: {0}")]
    TransferProtocol(String),

    /// A guest command that was expected to succeed exited non-zero
    #[error("command exited with error code {}", .0.exitcode)]
    UnexpectedExit(CmdResult),

    /// The tracer's stdout did not carry the fenced artifact list
    #[error("tracer output error: {0}")]
    TracerOutput(String),

    /// The detonation was interrupted by the operator (Ctrl-C)
    #[error("detonation interrupted")]
    Interrupted,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Error conditions in the execution of the VM controller.
///
/// These pertain to the controller and the VM it drives, never to the
/// exit status of guest commands.
#[derive(Error, Debug)]
pub enum QemuError {
    /// `start` was called on a controller that is already running
    #[error("VM controller already running")]
    AlreadyRunning,

    /// An operation that requires a running VM was called before `start`
    #[error("VM not started")]
    NotStarted,

    /// The hypervisor child process could not be spawned
    #[error("failed to spawn hypervisor: {0}")]
    Spawn(String),

    /// The console login state machine did not reach the user prompt
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// The QMP greeting or capabilities negotiation failed
    #[error("monitor handshake failed: {0}")]
    MonitorHandshake(String),

    /// A monitor request was rejected or the reply was malformed
    #[error("monitor error: {0}")]
    Monitor(String),

    /// The requested monitor operation is outside the supported whitelist
    #[error("monitor operation '{0}' is not supported")]
    UnsupportedMonitorOp(String),

    /// `expect` on the console timed out
    #[error("timed out waiting for prompt: {0}")]
    PromptTimeout(String),

    /// The `echo $?` output could not be parsed as an exit code
    #[error("could not parse exit code from {0:?}")]
    ExitParse(String),

    /// Live snapshot/reset requested for an architecture that only
    /// supports offline snapshots
    #[error("architecture {0} requires offline snapshots")]
    OfflineOnlyArch(Arch),

    /// Offline snapshot/reset requested while the VM is running
    #[error("cannot run an offline snapshot operation while the VM is running")]
    StillRunning,

    /// `qemu-img` failed against the on-disk image
    #[error("qemu-img failed: {0}")]
    ImageTool(String),

    /// `stop` was called while a command is still in flight
    #[error("attempted to stop the VM controller while a command is awaiting")]
    AwaitingBlocksStop,

    /// A second command was started while one is already in flight
    #[error("a command is already in flight")]
    AwaitingAlreadySet,

    /// `wait`/`terminate` was called with no command in flight
    #[error("no command currently in flight")]
    NoCommandInFlight,

    /// The text monitor shares the console; it cannot be used while a
    /// guest command is in flight
    #[error("console is busy with an in-flight command")]
    ConsoleBusy,

    /// Terminating over the remote shell needs the program name for pkill
    #[error("cannot terminate a remote-shell command without the program name")]
    PkillRequiresProg,

    /// Connection-level failure on the remote-shell channel
    #[error("remote shell error: {0}")]
    Shell(String),

    /// The hypervisor closed its console stream unexpectedly
    #[error("unexpected EOF on the console: {0}")]
    UnexpectedEof(String),
}
