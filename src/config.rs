//! Harness configuration.
//!
//! The configuration file is YAML with sections for the host network,
//! the sandbox guest defaults, per-architecture overrides, and the
//! fake-C2 guest. An architecture section only needs the keys that
//! differ from the sandbox defaults; everything else falls back.
//!
//! All validation happens while the [`Config`] is assembled, before any
//! side effect on the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::net::{FilterRule, FilterRuleSpec, NetConfig};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_transfer_server_cmd() -> String {
    "python iotftp/server.py {} {}".to_string()
}

fn default_tracer_cmd() -> String {
    "python analyse.py {}".to_string()
}

fn default_fakedns_cmd() -> String {
    "sudo python3 FakeDns/fakedns.py -c FakeDns/fakedns.conf".to_string()
}

fn default_pre_commands() -> Vec<CmdSpec> {
    vec![
        CmdSpec::waited("rm ~/cowrie/var/run/*"),
        CmdSpec::waited("cowrie/bin/cowrie start"),
    ]
}

fn default_post_commands() -> Vec<CmdSpec> {
    vec![CmdSpec::waited("cowrie/bin/cowrie stop")]
}

fn default_hash_type() -> String {
    "sha256".to_string()
}

/// A guest command plus whether the caller waits for it to finish.
#[derive(Debug, Clone, Deserialize)]
pub struct CmdSpec {
    pub cmd: String,
    #[serde(default = "CmdSpec::default_wait")]
    pub wait: bool,
}

impl CmdSpec {
    fn default_wait() -> bool {
        true
    }

    fn waited(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            wait: true,
        }
    }
}

/// Resolved, immutable configuration for one guest VM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub arch: Arch,
    pub user: String,
    pub passwd: String,
    pub image_dir: PathBuf,
    pub nic_helper: String,
    pub mac_addr: String,
    pub login_prompt: String,
    pub ip_addr: String,
    pub ssh_port: Option<u16>,
    pub use_ssh: bool,
    pub qmp_port: Option<u16>,
    pub use_qmp: bool,
    pub timeout: Duration,
}

impl VmConfig {
    /// Address of the guest's shell daemon, when commands should be
    /// routed over the remote shell instead of the console.
    pub fn ssh_target(&self) -> Option<(String, u16)> {
        if self.use_ssh {
            self.ssh_port.map(|p| (self.ip_addr.clone(), p))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralSection {
    pub sudo_passwd: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    pub bridge: String,
    pub dhcp_conf: PathBuf,
    pub ip_addr: String,
    pub nic_helper: String,
    pub file_transfer_port: u16,
    #[serde(default = "NetworkSection::default_encoding")]
    pub transfer_encoding: String,
    #[serde(default)]
    pub disallowed_archs: Vec<String>,
}

impl NetworkSection {
    fn default_encoding() -> String {
        "utf-8".to_string()
    }
}

/// One guest section; every key optional so per-architecture sections
/// can override just what differs from the sandbox defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmSection {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub passwd: Option<String>,
    #[serde(default)]
    pub image_dir: Option<PathBuf>,
    #[serde(default)]
    pub mac_addr: Option<String>,
    #[serde(default)]
    pub login_prompt: Option<String>,
    #[serde(default)]
    pub ip_addr: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub use_ssh: Option<bool>,
    #[serde(default)]
    pub qmp_port: Option<u16>,
    #[serde(default)]
    pub use_qmp: Option<bool>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl VmSection {
    // Self wins; missing keys fall back to `defaults`.
    fn merged_over(&self, defaults: &VmSection) -> VmSection {
        VmSection {
            user: self.user.clone().or_else(|| defaults.user.clone()),
            passwd: self.passwd.clone().or_else(|| defaults.passwd.clone()),
            image_dir: self.image_dir.clone().or_else(|| defaults.image_dir.clone()),
            mac_addr: self.mac_addr.clone().or_else(|| defaults.mac_addr.clone()),
            login_prompt: self
                .login_prompt
                .clone()
                .or_else(|| defaults.login_prompt.clone()),
            ip_addr: self.ip_addr.clone().or_else(|| defaults.ip_addr.clone()),
            ssh_port: self.ssh_port.or(defaults.ssh_port),
            use_ssh: self.use_ssh.or(defaults.use_ssh),
            qmp_port: self.qmp_port.or(defaults.qmp_port),
            use_qmp: self.use_qmp.or(defaults.use_qmp),
            timeout_secs: self.timeout_secs.or(defaults.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(flatten)]
    pub vm: VmSection,
    /// Command template that starts the in-guest transfer server,
    /// filled with the guest IP and port
    #[serde(default = "default_transfer_server_cmd")]
    pub transfer_server_cmd: String,
    /// Command template that runs the in-guest tracer driver,
    /// filled with the sample file name
    #[serde(default = "default_tracer_cmd")]
    pub tracer_cmd: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct C2Section {
    #[serde(flatten)]
    pub vm: VmSection,
    /// Commands run on the C2 guest before the detonation
    #[serde(default = "default_pre_commands")]
    pub pre_commands: Vec<CmdSpec>,
    /// Commands run on the C2 guest during shutdown
    #[serde(default = "default_post_commands")]
    pub post_commands: Vec<CmdSpec>,
    /// Command that starts the fake DNS resolver
    #[serde(default = "default_fakedns_cmd")]
    pub fakedns_cmd: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticSection {
    #[serde(default = "default_hash_type")]
    pub hash_type: String,
}

impl Default for StaticSection {
    fn default() -> Self {
        Self {
            hash_type: default_hash_type(),
        }
    }
}

/// Full harness configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: GeneralSection,
    pub network: NetworkSection,
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub arch: HashMap<String, VmSection>,
    pub c2: C2Section,
    #[serde(default)]
    pub filter_rules: Vec<FilterRuleSpec>,
    #[serde(default)]
    pub static_analysis: StaticSection,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for key in self.arch.keys() {
            let arch: Arch = key.parse()?;
            if arch == Arch::Cnc {
                return Err(Error::Config(
                    "the C2 guest is configured in the 'c2' section, not under 'arch'".into(),
                ));
            }
        }
        for tag in &self.network.disallowed_archs {
            let _: Arch = tag.parse()?;
        }
        // Reject invalid rules at load time, before any side effect on
        // the host; a rule must name at least one of src_ip/dst_ip.
        for spec in &self.filter_rules {
            if spec.src_ip.is_none() && spec.dst_ip.is_none() {
                return Err(Error::Config(format!(
                    "filter rule on {}/{} has neither src_ip nor dst_ip",
                    spec.table, spec.chain
                )));
            }
            let _ = FilterRule::try_from(spec.clone())?;
        }
        let _ = self.c2_vm()?;
        Ok(())
    }

    /// The host network layout the VMs live in.
    pub fn net(&self) -> NetConfig {
        NetConfig {
            bridge: self.network.bridge.clone(),
            dhcp_conf: self.network.dhcp_conf.clone(),
            ip_addr: self.network.ip_addr.clone(),
        }
    }

    /// Validated packet-filter rules to install during startup.
    pub fn filter_rules(&self) -> Result<Vec<FilterRule>> {
        self.filter_rules
            .iter()
            .cloned()
            .map(FilterRule::try_from)
            .collect()
    }

    /// Whether detonation on `arch` has been disabled by configuration.
    pub fn arch_allowed(&self, arch: Arch) -> bool {
        !self
            .network
            .disallowed_archs
            .iter()
            .any(|tag| tag.parse::<Arch>().map(|a| a == arch).unwrap_or(false))
    }

    /// Resolve the sandbox VM configuration for `arch`, applying the
    /// per-architecture overrides over the sandbox defaults.
    pub fn sandbox_vm(&self, arch: Arch) -> Result<VmConfig> {
        let section = match self.arch.get(&arch.to_string()) {
            Some(overrides) => overrides.merged_over(&self.sandbox.vm),
            None => self.sandbox.vm.clone(),
        };
        self.resolve_vm(arch, &section)
    }

    /// Resolve the fake-C2 VM configuration.
    pub fn c2_vm(&self) -> Result<VmConfig> {
        self.resolve_vm(Arch::Cnc, &self.c2.vm)
    }

    fn resolve_vm(&self, arch: Arch, section: &VmSection) -> Result<VmConfig> {
        let missing = |key: &str| Error::Config(format!("missing key '{key}' for {arch} VM"));

        let use_qmp = section.use_qmp.unwrap_or(false);
        let use_ssh = section.use_ssh.unwrap_or(false);
        if use_qmp && section.qmp_port.is_none() {
            return Err(Error::Config(format!(
                "{arch} VM enables the JSON monitor but sets no qmp_port"
            )));
        }
        if use_ssh && section.ssh_port.is_none() {
            return Err(Error::Config(format!(
                "{arch} VM enables the remote shell but sets no ssh_port"
            )));
        }

        Ok(VmConfig {
            arch,
            user: section.user.clone().ok_or_else(|| missing("user"))?,
            passwd: section.passwd.clone().ok_or_else(|| missing("passwd"))?,
            image_dir: section
                .image_dir
                .clone()
                .ok_or_else(|| missing("image_dir"))?,
            nic_helper: self.network.nic_helper.clone(),
            mac_addr: section
                .mac_addr
                .clone()
                .ok_or_else(|| missing("mac_addr"))?,
            login_prompt: section
                .login_prompt
                .clone()
                .ok_or_else(|| missing("login_prompt"))?,
            ip_addr: section.ip_addr.clone().ok_or_else(|| missing("ip_addr"))?,
            ssh_port: section.ssh_port,
            use_ssh,
            qmp_port: section.qmp_port,
            use_qmp,
            timeout: Duration::from_secs(section.timeout_secs.unwrap_or_else(default_timeout_secs)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
general:
  sudo_passwd: hunter2
network:
  bridge: cbr0
  dhcp_conf: /etc/cinderbox/dhcpd.conf
  ip_addr: 192.168.0.1
  nic_helper: /usr/lib/qemu/qemu-bridge-helper
  file_transfer_port: 41997
sandbox:
  user: root
  passwd: toor
  ip_addr: 192.168.0.20
  login_prompt: "sandbox login: "
c2:
  user: c2
  passwd: c2pass
  image_dir: /vms/c2
  mac_addr: 52:54:00:00:00:02
  ip_addr: 192.168.0.2
  login_prompt: "c2 login: "
  use_ssh: true
  ssh_port: 2222
arch:
  ARM:
    image_dir: /vms/arm
    mac_addr: 52:54:00:00:00:10
  MIPS:
    image_dir: /vms/mips
    mac_addr: 52:54:00:00:00:11
    user: admin
"#;

    #[test]
    fn arch_section_falls_back_to_sandbox_defaults() {
        let config = Config::from_yaml(BASE).unwrap();
        let arm = config.sandbox_vm(Arch::Arm).unwrap();
        assert_eq!(arm.user, "root");
        assert_eq!(arm.image_dir, PathBuf::from("/vms/arm"));
        assert_eq!(arm.login_prompt, "sandbox login: ");

        let mips = config.sandbox_vm(Arch::Mips).unwrap();
        assert_eq!(mips.user, "admin");
        assert_eq!(mips.passwd, "toor");
    }

    #[test]
    fn missing_required_key_is_config_error() {
        let config = Config::from_yaml(BASE).unwrap();
        // No MIPSEL section and the sandbox defaults carry no image_dir.
        let err = config.sandbox_vm(Arch::Mipsel).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn c2_resolves_with_ssh_target() {
        let config = Config::from_yaml(BASE).unwrap();
        let c2 = config.c2_vm().unwrap();
        assert_eq!(c2.arch, Arch::Cnc);
        assert_eq!(
            c2.ssh_target(),
            Some(("192.168.0.2".to_string(), 2222))
        );
    }

    #[test]
    fn qmp_without_port_is_rejected() {
        let text = BASE.replace("use_ssh: true", "use_qmp: true");
        let text = text.replace("ssh_port: 2222", "");
        assert!(Config::from_yaml(&text).is_err());
    }

    #[test]
    fn default_command_scripts_are_populated() {
        let config = Config::from_yaml(BASE).unwrap();
        assert_eq!(config.c2.pre_commands.len(), 2);
        assert!(config.c2.pre_commands[1].cmd.contains("cowrie start"));
        assert!(config.sandbox.transfer_server_cmd.contains("{}"));
    }

    #[test]
    fn rule_without_src_or_dst_is_rejected_at_load() {
        let text = format!(
            "{BASE}\nfilter_rules:\n  - chain: FORWARD\n    target: DROP\n"
        );
        let err = Config::from_yaml(&text).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let text = format!(
            "{BASE}\nfilter_rules:\n  - chain: FORWARD\n    target: DROP\n    src_ip: 192.168.0.20\n"
        );
        assert!(Config::from_yaml(&text).is_ok());
    }

    #[test]
    fn disallowed_arch_list_is_honored() {
        let text = BASE.replace(
            "  file_transfer_port: 41997",
            "  file_transfer_port: 41997\n  disallowed_archs: [\"PPC\"]",
        );
        let config = Config::from_yaml(&text).unwrap();
        assert!(!config.arch_allowed(Arch::Ppc));
        assert!(config.arch_allowed(Arch::Arm));
    }
}
