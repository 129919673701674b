//! Parser for the syscall trace files recorded in the guest.
//!
//! Traces are plain `strace` output, one file per traced process. Each
//! line of interest has the shape
//! `name(param, param, ...) = result [elaboration]`.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::Result;

const SYSCALL_PATTERN: &str = r"([_a-zA-Z0-9]+)\((.*)\) *(= -?[0-9x]+) ?(.*)";

fn syscall_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SYSCALL_PATTERN).expect("syscall pattern compiles"))
}

/// One parsed syscall invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Syscall {
    pub name: String,
    pub params: Vec<String>,
    pub result: String,
    /// Trailing annotation strace prints after the result, e.g. an
    /// errno explanation
    pub elaboration: String,
}

/// Parse every syscall line in a trace file.
pub fn parse_trace_file(path: &Path) -> Result<Vec<Syscall>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_trace(&text))
}

/// Parse syscall lines out of raw trace text.
pub fn parse_trace(text: &str) -> Vec<Syscall> {
    syscall_re()
        .captures_iter(text)
        .map(|caps| Syscall {
            name: caps[1].to_string(),
            params: extract_params(&caps[2]),
            result: cleanup_result(&caps[3]),
            elaboration: caps[4].trim().to_string(),
        })
        .collect()
}

// Split the parameter string on top-level commas; commas inside a
// struct literal `{...}` belong to the parameter.
fn extract_params(params: &str) -> Vec<String> {
    if params.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut buf = String::new();
    let mut in_struct = false;
    for c in params.chars() {
        match c {
            ',' if !in_struct => {
                out.push(buf.trim().to_string());
                buf.clear();
            }
            '{' if !in_struct => {
                buf.push(c);
                in_struct = true;
            }
            '}' if in_struct => {
                buf.push(c);
                in_struct = false;
            }
            _ => buf.push(c),
        }
    }
    out.push(buf.trim().to_string());
    out
}

fn cleanup_result(result: &str) -> String {
    result.strip_prefix("= ").unwrap_or(result).to_string()
}
