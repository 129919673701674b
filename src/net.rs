//! Host network fabric for a detonation.
//!
//! Builds the bridge, address, DHCP, and packet-filter state the guests
//! live in, and tears it down again. Every external effect is a
//! privileged shell command run through `sudo`; teardown is idempotent
//! and keeps going past individual failures so a botched setup never
//! leaves stray state behind.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Packet-filter table a rule lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        };
        f.write_str(s)
    }
}

/// Chain a rule is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Chain {
    Prerouting,
    Postrouting,
    Forward,
    Input,
    Output,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Postrouting => "POSTROUTING",
            Chain::Forward => "FORWARD",
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
        };
        f.write_str(s)
    }
}

/// Whether a rule is inserted at the head of its chain or appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Insert,
    Append,
}

impl RuleAction {
    fn flag(self) -> &'static str {
        match self {
            RuleAction::Insert => "-I",
            RuleAction::Append => "-A",
        }
    }
}

/// A packet-filter rule as it appears in the configuration file.
///
/// Validated into a [`FilterRule`] before use.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterRuleSpec {
    #[serde(default = "FilterRuleSpec::default_table")]
    pub table: Table,
    pub chain: Chain,
    pub target: String,
    #[serde(default)]
    pub target_args: Vec<String>,
    #[serde(default)]
    pub dst_ip: Option<String>,
    #[serde(default)]
    pub src_ip: Option<String>,
    #[serde(default)]
    pub iface: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub dport: Option<u16>,
    #[serde(default)]
    pub sport: Option<u16>,
}

impl FilterRuleSpec {
    fn default_table() -> Table {
        Table::Filter
    }
}

/// A validated packet-filter rule. At least one of the source and
/// destination addresses is always present.
#[derive(Debug, Clone)]
pub struct FilterRule {
    table: Table,
    chain: Chain,
    target: String,
    target_args: Vec<String>,
    dst_ip: Option<String>,
    src_ip: Option<String>,
    iface: Option<String>,
    protocol: Option<String>,
    dport: Option<u16>,
    sport: Option<u16>,
}

impl TryFrom<FilterRuleSpec> for FilterRule {
    type Error = Error;

    fn try_from(spec: FilterRuleSpec) -> Result<Self> {
        if spec.dst_ip.is_none() && spec.src_ip.is_none() {
            return Err(Error::Config(format!(
                "filter rule on {}/{} has neither src_ip nor dst_ip",
                spec.table, spec.chain
            )));
        }
        Ok(Self {
            table: spec.table,
            chain: spec.chain,
            target: spec.target,
            target_args: spec.target_args,
            dst_ip: spec.dst_ip,
            src_ip: spec.src_ip,
            iface: spec.iface,
            protocol: spec.protocol,
            dport: spec.dport,
            sport: spec.sport,
        })
    }
}

impl FilterRule {
    pub fn table(&self) -> Table {
        self.table
    }

    /// Serialize the rule to an `iptables` argument vector, omitting the
    /// options that are not set.
    pub fn to_args(&self, action: RuleAction) -> Vec<String> {
        let mut args = vec![
            "iptables".to_string(),
            "-t".to_string(),
            self.table.to_string(),
            action.flag().to_string(),
            self.chain.to_string(),
        ];

        if let Some(iface) = &self.iface {
            args.push("-i".into());
            args.push(iface.clone());
        }
        if let Some(protocol) = &self.protocol {
            args.push("-p".into());
            args.push(protocol.clone());
        }
        if let Some(dport) = self.dport {
            args.push("--dport".into());
            args.push(dport.to_string());
        }
        if let Some(sport) = self.sport {
            args.push("--sport".into());
            args.push(sport.to_string());
        }
        if let Some(dst) = &self.dst_ip {
            args.push("-d".into());
            args.push(dst.clone());
        }
        if let Some(src) = &self.src_ip {
            args.push("-s".into());
            args.push(src.clone());
        }

        args.push("-j".into());
        args.push(self.target.clone());
        args.extend(self.target_args.iter().cloned());
        args
    }
}

/// Host network layout for one detonation.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub bridge: String,
    pub dhcp_conf: PathBuf,
    pub ip_addr: String,
}

/// Creates and destroys the network environment the sandbox and C2
/// guests share: one bridge carrying both tap interfaces, an address on
/// it, a DHCP server, and the configured filter rules.
pub struct NetFabric {
    config: NetConfig,
    sudo_passwd: String,
    /// Rules installed so far; teardown flushes exactly their tables
    rules: Vec<FilterRule>,
}

impl NetFabric {
    pub fn new(config: NetConfig, sudo_passwd: String) -> Self {
        Self {
            config,
            sudo_passwd,
            rules: Vec::new(),
        }
    }

    /// Bring up the bridge, address it, and start the DHCP server.
    ///
    /// Any failing step tears down whatever was already created before
    /// the error is returned.
    pub async fn setup(&mut self) -> Result<()> {
        info!(bridge = %self.config.bridge, "setting up network fabric");

        let bridge = self.config.bridge.clone();
        let cidr = format!("{}/24", self.config.ip_addr);
        let dhcp_conf = self.config.dhcp_conf.display().to_string();
        let steps: Vec<Vec<String>> = vec![
            argv(&["ip", "link", "add", bridge.as_str(), "type", "bridge"]),
            argv(&["ip", "link", "set", bridge.as_str(), "up"]),
            argv(&[
                "ip",
                "addr",
                "add",
                cidr.as_str(),
                "brd",
                "+",
                "dev",
                bridge.as_str(),
            ]),
            argv(&["dhcpd", "-cf", dhcp_conf.as_str()]),
        ];

        for step in steps {
            if let Err(e) = self.run_privileged(&step).await {
                warn!("network setup failed, tearing down partial state");
                self.teardown().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tear everything down, unconditionally and idempotently.
    ///
    /// Steps whose precondition no longer holds (the DHCP server was
    /// never started, the bridge was never created) fail individually
    /// and are ignored.
    pub async fn teardown(&mut self) {
        info!(bridge = %self.config.bridge, "tearing down network fabric");

        let bridge = self.config.bridge.clone();
        self.run_ignoring_failure(&argv(&["pkill", "dhcpd"])).await;
        self.run_ignoring_failure(&argv(&["ip", "link", "set", bridge.as_str(), "down"]))
            .await;
        self.run_ignoring_failure(&argv(&[
            "ip",
            "link",
            "delete",
            bridge.as_str(),
            "type",
            "bridge",
        ]))
        .await;
        self.flush_rules().await;
    }

    /// Install a rule at the head of its chain and track it.
    pub async fn insert_rule(&mut self, rule: FilterRule) -> Result<()> {
        self.run_privileged(&rule.to_args(RuleAction::Insert)).await?;
        self.rules.push(rule);
        Ok(())
    }

    /// Append a rule to its chain and track it.
    pub async fn append_rule(&mut self, rule: FilterRule) -> Result<()> {
        self.run_privileged(&rule.to_args(RuleAction::Append)).await?;
        self.rules.push(rule);
        Ok(())
    }

    /// Flush the filter tables touched by tracked rules.
    pub async fn flush_rules(&mut self) {
        let tables: BTreeSet<Table> = self.rules.iter().map(|r| r.table()).collect();
        for table in tables {
            let table = table.to_string();
            self.run_ignoring_failure(&argv(&["iptables", "-t", table.as_str(), "-F"]))
                .await;
        }
        self.rules.clear();
    }

    async fn run_privileged(&self, args: &[String]) -> Result<()> {
        debug!(cmd = %args.join(" "), "running privileged command");

        let mut child = Command::new("sudo")
            .arg("-S")
            .arg("-p")
            .arg("")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Net(format!("failed to spawn sudo: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin
                .write_all(format!("{}\n", self.sudo_passwd).as_bytes())
                .await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Net(format!("failed to reap sudo: {e}")))?;

        if !output.status.success() {
            return Err(Error::Net(format!(
                "'{}' failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn run_ignoring_failure(&self, args: &[String]) {
        if let Err(e) = self.run_privileged(args).await {
            debug!("ignoring teardown failure: {e}");
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> FilterRuleSpec {
        FilterRuleSpec {
            table: Table::Nat,
            chain: Chain::Prerouting,
            target: "DNAT".into(),
            target_args: vec!["--to-destination".into(), "192.168.0.2".into()],
            dst_ip: Some("192.168.0.20".into()),
            src_ip: None,
            iface: Some("cbr0".into()),
            protocol: Some("tcp".into()),
            dport: Some(53),
            sport: None,
        }
    }

    #[test]
    fn rule_serializes_in_positional_order() {
        let rule = FilterRule::try_from(spec()).unwrap();
        let args = rule.to_args(RuleAction::Insert);
        assert_eq!(
            args,
            vec![
                "iptables", "-t", "nat", "-I", "PREROUTING", "-i", "cbr0", "-p", "tcp",
                "--dport", "53", "-d", "192.168.0.20", "-j", "DNAT", "--to-destination",
                "192.168.0.2",
            ]
        );
    }

    #[test]
    fn unset_options_are_omitted() {
        let mut s = spec();
        s.iface = None;
        s.protocol = None;
        s.dport = None;
        let rule = FilterRule::try_from(s).unwrap();
        let args = rule.to_args(RuleAction::Append);
        assert_eq!(
            args,
            vec![
                "iptables", "-t", "nat", "-A", "PREROUTING", "-d", "192.168.0.20", "-j",
                "DNAT", "--to-destination", "192.168.0.2",
            ]
        );
    }

    #[test]
    fn rule_without_src_or_dst_is_rejected() {
        let mut s = spec();
        s.dst_ip = None;
        s.src_ip = None;
        let err = FilterRule::try_from(s).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn sport_and_src_are_emitted_when_set() {
        let mut s = spec();
        s.sport = Some(4000);
        s.src_ip = Some("192.168.0.30".into());
        let rule = FilterRule::try_from(s).unwrap();
        let args = rule.to_args(RuleAction::Insert);
        let joined = args.join(" ");
        assert!(joined.contains("--sport 4000"));
        assert!(joined.contains("-d 192.168.0.20 -s 192.168.0.30"));
    }

    #[test]
    fn table_and_chain_render_like_iptables_expects() {
        assert_eq!(Table::Mangle.to_string(), "mangle");
        assert_eq!(Chain::Postrouting.to_string(), "POSTROUTING");
    }

    #[test]
    fn rule_spec_deserializes_from_yaml() {
        let yaml = r#"
table: nat
chain: PREROUTING
target: DNAT
target_args: ["--to-destination", "192.168.0.2"]
dst_ip: 192.168.0.20
protocol: udp
dport: 53
"#;
        let spec: FilterRuleSpec = serde_yaml::from_str(yaml).unwrap();
        let rule = FilterRule::try_from(spec).unwrap();
        assert_eq!(rule.table(), Table::Nat);
    }
}
