//! Final analysis report.
//!
//! A serializable record combining the static and dynamic results of a
//! sample, exported as JSON so generic front-ends can consume it.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::analysis::syscalls::Syscall;
use crate::error::Result;
use crate::pipeline::DetonationResult;
use crate::static_analysis::StaticResult;

/// Dynamic-analysis section of the report: the raw detonation record
/// plus the parsed artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct DynamicReport {
    #[serde(flatten)]
    pub detonation: DetonationResult,
    /// Names the fake DNS resolver answered
    pub dns_requests: Vec<String>,
    /// Parsed syscall traces, keyed by guest PID
    pub syscalls_by_pid: BTreeMap<String, Vec<Syscall>>,
}

/// Full result of analyzing one sample.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub sample: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_analysis: Option<StaticResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<DynamicReport>,
}

impl Report {
    pub fn new(sample: impl Into<String>) -> Self {
        Self {
            sample: sample.into(),
            static_analysis: None,
            dynamic: None,
        }
    }

    /// Serialize the report as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The guest PID encoded in a trace file name (`strace_<prefix>.<pid>`).
pub fn trace_pid(filename: &str) -> Option<&str> {
    filename.rsplit('.').next().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_comes_from_the_trace_suffix() {
        assert_eq!(trace_pid("strace_testelf.101"), Some("101"));
        assert_eq!(trace_pid("strace_abcdefgh.7"), Some("7"));
    }

    #[test]
    fn report_omits_absent_sections() {
        let report = Report::new("testelf");
        let json = report.to_json().unwrap();
        assert!(json.contains("\"sample\""));
        assert!(!json.contains("static_analysis"));
        assert!(!json.contains("dynamic"));
    }
}
