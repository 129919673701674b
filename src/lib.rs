//! cinderbox: IoT-malware detonation harness
//!
//! Detonates a potentially hostile binary inside an emulated QEMU
//! sandbox, next to a second guest hosting fake command-and-control
//! services (an SSH honeypot and a fake DNS resolver), and brings the
//! sample's network traffic, syscall traces, and dropped files back to
//! the host.
//!
//! # Key properties
//!
//! - **Reproducible**: the sandbox is snapshotted clean before every
//!   detonation and reset afterwards, live or offline depending on the
//!   guest architecture.
//! - **Recoverable**: network and VM state is acquired in ordered steps
//!   with compensating teardown on every failure path.
//! - **Typed failures**: configuration, hypervisor, network, and
//!   transfer errors each surface as their own error type.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use cinderbox::config::Config;
//! use cinderbox::orchestrator::{AnalysisMode, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file(Path::new("config.yaml"))?;
//!     let orchestrator = Orchestrator::new(config)?;
//!
//!     let report = orchestrator
//!         .run(Path::new("./sample.bin"), AnalysisMode::Full)
//!         .await?;
//!
//!     println!("{}", report.to_json()?);
//!     Ok(())
//! }
//! ```

// Core orchestration
pub mod arch;
pub mod config;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod transfer;
pub mod vm;

// Analysis and reporting around the detonation
pub mod analysis;
pub mod orchestrator;
pub mod report;
pub mod static_analysis;

// Re-exports for convenience
pub use error::{Error, QemuError, Result};
pub use pipeline::{DetonationPipeline, DetonationResult};
pub use vm::{CmdResult, VmController};

// Prelude for common imports
pub mod prelude {
    pub use crate::arch::Arch;
    pub use crate::config::Config;
    pub use crate::error::{Error, QemuError, Result};
    pub use crate::net::{FilterRule, NetFabric};
    pub use crate::orchestrator::{AnalysisMode, Orchestrator};
    pub use crate::pipeline::{DetonationPipeline, DetonationResult};
    pub use crate::report::Report;
    pub use crate::transfer::TransferClient;
    pub use crate::vm::{CmdResult, VmController, VmState};
}
