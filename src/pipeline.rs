//! Detonation pipeline.
//!
//! The top-level sequencer for one detonation: it owns the sandbox and
//! fake-C2 VM controllers, the network fabric, and the file-transfer
//! client, and drives them through the ordered lifecycle
//!
//! ```text
//! net up -> filter rules -> VMs up -> clean snapshot -> C2 prepared
//!   -> sample pushed -> tracer run -> artifacts pulled
//!   -> reset -> VMs down -> net down
//! ```
//!
//! Startup is transactional: every step is a save-point, and a failure
//! releases everything acquired so far before the error is returned.
//! Shutdown is the error-path handler, so it never raises; failures are
//! logged and the teardown keeps going.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::arch::Arch;
use crate::config::{CmdSpec, Config};
use crate::error::{Error, Result};
use crate::net::{FilterRule, NetFabric};
use crate::transfer::TransferClient;
use crate::vm::VmController;

/// Marker opening the fenced artifact list in the tracer's stdout.
pub const FILE_LIST_START: &str = "===== LIST OF FILES TO RETRIEVE =====";
/// Marker closing the fenced artifact list.
pub const FILE_LIST_END: &str = "===== END LIST =====";

/// Snapshot tag for the pristine guest state.
pub const SNAPSHOT_TAG: &str = "clean";

// Command template to make the sample executable, filled with its name.
const SET_PERMS_CMD: &str = "chmod u+x {}";

/// Artifacts and timing captured by one detonation.
#[derive(Debug, Clone, Serialize)]
pub struct DetonationResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Packet-capture file recorded in the guest
    pub pcap: String,
    /// Per-process syscall trace files
    pub syscalls: Vec<String>,
    /// Other files the sample created
    pub created_files: Vec<String>,
    /// Accumulated stdout of the fake DNS resolver
    pub dns_log: String,
}

/// Sequencer for one detonation; see the module docs for the lifecycle.
///
/// A pipeline instance handles a single detonation at a time; the
/// network fabric, monitor port, and transfer port it owns are
/// process-wide resources.
pub struct DetonationPipeline {
    vm: VmController,
    c2: VmController,
    net: NetFabric,
    transfer: TransferClient,
    pending_rules: Vec<FilterRule>,
    pre_commands: Vec<CmdSpec>,
    post_commands: Vec<CmdSpec>,
    fakedns_cmd: String,
    transfer_server_cmd: String,
    tracer_cmd: String,
    transfer_addr: (String, u16),
    net_up: bool,
}

impl DetonationPipeline {
    /// Assemble a pipeline for detonating a sample of architecture
    /// `arch`. Fails before any side effect if the configuration is
    /// incomplete or the architecture is disallowed.
    pub fn new(config: &Config, arch: Arch) -> Result<Self> {
        if !config.arch_allowed(arch) {
            return Err(Error::Config(format!(
                "architecture {arch} is disallowed by configuration"
            )));
        }

        let vm_config = config.sandbox_vm(arch)?;
        let c2_config = config.c2_vm()?;
        let transfer_addr = (
            vm_config.ip_addr.clone(),
            config.network.file_transfer_port,
        );
        let transfer = TransferClient::new(
            transfer_addr.0.clone(),
            transfer_addr.1,
            &config.network.transfer_encoding,
        )?;

        Ok(Self {
            vm: VmController::new(vm_config),
            c2: VmController::new(c2_config),
            net: NetFabric::new(config.net(), config.general.sudo_passwd.clone()),
            transfer,
            pending_rules: config.filter_rules()?,
            pre_commands: config.c2.pre_commands.clone(),
            post_commands: config.c2.post_commands.clone(),
            fakedns_cmd: config.c2.fakedns_cmd.clone(),
            transfer_server_cmd: config.sandbox.transfer_server_cmd.clone(),
            tracer_cmd: config.sandbox.tracer_cmd.clone(),
            transfer_addr,
            net_up: false,
        })
    }

    /// Bring up the network and both VMs, snapshot the sandbox, and
    /// prepare the C2 services.
    ///
    /// On failure, every resource acquired before the failing step has
    /// been released by the time the error is returned.
    pub async fn startup(&mut self) -> Result<()> {
        info!("setting up network");
        self.net.setup().await?;
        self.net_up = true;

        if let Err(e) = self.startup_guests().await {
            error!("startup failed, releasing acquired resources: {e}");
            self.release_acquired().await;
            return Err(e);
        }
        Ok(())
    }

    async fn startup_guests(&mut self) -> Result<()> {
        info!("adding filter rules");
        let rules = std::mem::take(&mut self.pending_rules);
        for rule in rules {
            self.net.append_rule(rule).await?;
        }

        // Live snapshots segfault these guests, so the pristine state is
        // recorded against the disk image before first boot.
        if self.vm.needs_offline_snapshot() {
            debug!("taking offline snapshot before starting the sandbox");
            self.vm.offline_snapshot(SNAPSHOT_TAG).await?;
        }

        info!("starting sandbox VM");
        let vm_ssh = self.vm.config().ssh_target();
        self.vm.start_noninteractive(vm_ssh).await?;

        info!("starting fake C2 VM");
        let c2_ssh = self.c2.config().ssh_target();
        self.c2.start_noninteractive(c2_ssh).await?;

        if !self.vm.needs_offline_snapshot() {
            debug!("taking clean snapshot of the sandbox");
            self.vm.snapshot(SNAPSHOT_TAG).await?;
        }

        info!("preparing C2 VM for detonation");
        let pre_commands = self.pre_commands.clone();
        for cmd in &pre_commands {
            debug!(cmd = %cmd.cmd, "running C2 pre-command");
            if let Some(res) = self.c2.run(&cmd.cmd, cmd.wait).await? {
                if !res.success() {
                    error!(
                        cmd = %cmd.cmd,
                        exitcode = res.exitcode,
                        output = %res.output,
                        "C2 pre-command failed"
                    );
                    return Err(Error::UnexpectedExit(res));
                }
            }
        }
        Ok(())
    }

    /// Detonate `sample` (already present in the working directory) and
    /// collect its artifacts.
    pub async fn run(&mut self, sample: &str) -> Result<DetonationResult> {
        let started_at = Utc::now();

        info!("loading sample onto sandbox VM");
        self.start_transfer_server().await?;
        self.send_sample(sample).await?;

        let perms = fill_template(SET_PERMS_CMD, &[sample]);
        if let Some(res) = self.vm.run(&perms, true).await? {
            if !res.success() {
                return Err(Error::UnexpectedExit(res));
            }
        }

        debug!("starting fake DNS resolver on the C2 VM");
        let fakedns_cmd = self.fakedns_cmd.clone();
        self.c2.run(&fakedns_cmd, false).await?;

        info!("running tracer, this blocks for the detonation window");
        let tracer = fill_template(&self.tracer_cmd, &[sample]);
        let trace_res = self
            .vm
            .run(&tracer, true)
            .await?
            .ok_or_else(|| Error::TracerOutput("tracer produced no result".into()))?;

        let dns_res = self.c2.terminate_existing(Some("python3")).await?;
        debug!(dns_output_len = dns_res.output.len(), "fake DNS terminated");

        if !trace_res.success() {
            return Err(Error::UnexpectedExit(trace_res));
        }

        let files = extract_file_list(&trace_res.output)?;
        let prefix = sample_prefix(sample);
        let (syscalls, pcap, created_files) = classify_artifacts(prefix, &files)?;

        info!(count = files.len(), "retrieving artifacts from sandbox VM");
        self.start_transfer_server().await?;
        for file in &files {
            info!(file, "retrieving artifact");
            self.transfer.get(file).await?;
        }
        self.transfer.bye().await?;
        let server_res = self.vm.wait_existing().await?;
        debug!(exitcode = server_res.exitcode, "transfer server exited");

        let finished_at = Utc::now();
        Ok(DetonationResult {
            started_at,
            finished_at,
            pcap,
            syscalls,
            created_files,
            dns_log: dns_res.output,
        })
    }

    /// Tear everything down after a detonation or on the error path.
    ///
    /// Every step is best-effort: failures are logged, never raised.
    pub async fn shutdown(&mut self) {
        info!("shutting down detonation infrastructure");

        let post_commands = self.post_commands.clone();
        for cmd in &post_commands {
            debug!(cmd = %cmd.cmd, "running C2 post-command");
            match self.c2.run(&cmd.cmd, cmd.wait).await {
                Ok(Some(res)) if !res.success() => {
                    warn!(cmd = %cmd.cmd, exitcode = res.exitcode, "C2 post-command failed")
                }
                Ok(_) => {}
                Err(e) => warn!(cmd = %cmd.cmd, "C2 post-command errored: {e}"),
            }
        }

        if self.vm.is_running() && !self.vm.needs_offline_snapshot() {
            debug!("resetting sandbox to clean snapshot");
            if let Err(e) = self.vm.reset(SNAPSHOT_TAG).await {
                warn!("sandbox reset failed: {e}");
            }
        }

        info!("stopping sandbox VM");
        if let Err(e) = self.vm.stop(true).await {
            warn!("sandbox stop failed: {e}");
        }
        info!("stopping fake C2 VM");
        if let Err(e) = self.c2.stop(true).await {
            warn!("C2 stop failed: {e}");
        }

        if self.vm.needs_offline_snapshot() {
            debug!("resetting sandbox image offline");
            if let Err(e) = self.vm.offline_reset(SNAPSHOT_TAG).await {
                warn!("offline reset failed: {e}");
            }
        }

        info!("shutting down network");
        self.net.flush_rules().await;
        self.net.teardown().await;
        self.net_up = false;
    }

    // Compensating teardown for a startup that failed partway through.
    async fn release_acquired(&mut self) {
        if let Err(e) = self.vm.stop(true).await {
            warn!("sandbox stop during release failed: {e}");
        }
        if let Err(e) = self.c2.stop(true).await {
            warn!("C2 stop during release failed: {e}");
        }
        if self.net_up {
            self.net.teardown().await;
            self.net_up = false;
        }
    }

    // Launch the in-guest transfer server without waiting; its exit is
    // reaped after the BYE that shuts it down.
    async fn start_transfer_server(&mut self) -> Result<()> {
        let host = self.transfer_addr.0.clone();
        let port = self.transfer_addr.1.to_string();
        let cmd = fill_template(&self.transfer_server_cmd, &[host.as_str(), port.as_str()]);
        debug!(cmd, "starting in-guest transfer server");
        self.vm.run(&cmd, false).await?;
        Ok(())
    }

    async fn send_sample(&mut self, sample: &str) -> Result<()> {
        match self.transfer.put(sample).await {
            Ok(()) => {}
            Err(e @ Error::TransferServer { .. }) => {
                error!("transfer server rejected the sample: {e}");
                let res = self.vm.terminate_existing(None).await?;
                debug!(exitcode = res.exitcode, "transfer server terminated");
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        self.transfer.bye().await?;
        let res = self.vm.wait_existing().await?;
        if !res.success() {
            return Err(Error::UnexpectedExit(res));
        }
        Ok(())
    }
}

/// First eight characters of the sample's file name, or the whole name
/// if shorter; artifact names in the guest are derived from it.
pub fn sample_prefix(name: &str) -> &str {
    match name.char_indices().nth(8) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

/// Extract the fenced artifact list from the tracer's stdout.
///
/// The block between the two markers is the only machine-readable part
/// of that output; nothing else is depended on.
pub fn extract_file_list(output: &str) -> Result<Vec<String>> {
    let start = output
        .find(FILE_LIST_START)
        .ok_or_else(|| Error::TracerOutput("missing artifact list start marker".into()))?;
    let after = &output[start + FILE_LIST_START.len()..];
    let end = after
        .find(FILE_LIST_END)
        .ok_or_else(|| Error::TracerOutput("missing artifact list end marker".into()))?;

    Ok(after[..end]
        .trim()
        .split('\n')
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

/// Split the artifact list into syscall traces, the packet capture, and
/// files the sample created.
///
/// Trace files match `strace_<prefix>.<pid>`; the capture is
/// `<prefix>.pcap` or `<prefix>.pcapng`.
pub fn classify_artifacts(
    prefix: &str,
    files: &[String],
) -> Result<(Vec<String>, String, Vec<String>)> {
    let strace_re = Regex::new(&format!(r"^strace_{}\.[0-9]+$", regex::escape(prefix)))
        .map_err(|e| Error::TracerOutput(format!("bad trace pattern: {e}")))?;
    let pcap_names = [format!("{prefix}.pcap"), format!("{prefix}.pcapng")];

    let syscalls: Vec<String> = files
        .iter()
        .filter(|f| strace_re.is_match(f))
        .cloned()
        .collect();

    let pcap = files
        .iter()
        .find(|f| pcap_names.contains(f))
        .cloned()
        .unwrap_or_else(|| pcap_names[1].clone());

    let created: Vec<String> = files
        .iter()
        .filter(|f| !strace_re.is_match(f) && **f != pcap)
        .cloned()
        .collect();

    Ok((syscalls, pcap, created))
}

fn fill_template(template: &str, args: &[&str]) -> String {
    let mut out = template.to_string();
    for arg in args {
        out = out.replacen("{}", arg, 1);
    }
    out
}
