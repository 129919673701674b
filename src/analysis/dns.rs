//! Scraper for the fake DNS resolver's log output.
//!
//! The resolver prints one `>> Matched Request - <name>.` line per query
//! it answered; the captured stdout is the only record of the sample's
//! DNS activity besides the packet capture.

use std::sync::OnceLock;

use regex::Regex;

const DNS_PATTERN: &str = r">> *Matched Request - (.*).";

fn dns_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DNS_PATTERN).expect("dns pattern compiles"))
}

/// Names the fake resolver answered, in log order.
pub fn parse_dns_log(log: &str) -> Vec<String> {
    dns_re()
        .captures_iter(log)
        .map(|caps| caps[1].to_string())
        .collect()
}
