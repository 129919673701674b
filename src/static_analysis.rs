//! Static analysis of a sample before detonation.
//!
//! Computes the configured digest, extracts printable strings with
//! their byte offsets, and reads the ELF header to pick the sandbox
//! architecture. Nothing here executes the sample.

use std::path::Path;

use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::arch::{detect_elf_arch, Arch};
use crate::error::{Error, Result};

// `strings`' default: runs shorter than this are noise.
const MIN_STRING_LEN: usize = 4;

/// A printable string found in the sample, with its byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StringHit {
    pub offset: u64,
    pub string: String,
}

/// Everything static analysis learns about a sample.
#[derive(Debug, Clone, Serialize)]
pub struct StaticResult {
    /// Digest of the configured type
    pub hash: String,
    pub hash_type: String,
    pub strings: Vec<StringHit>,
    pub arch: Arch,
}

/// Runs hashing, string extraction, and architecture detection.
pub struct StaticAnalyzer {
    hash_type: String,
}

impl StaticAnalyzer {
    pub fn new(hash_type: &str) -> Self {
        Self {
            hash_type: hash_type.to_string(),
        }
    }

    /// Analyze the sample at `path`.
    pub fn analyze(&self, path: &Path) -> Result<StaticResult> {
        let data = std::fs::read(path)?;

        let hash = match self.hash_type.to_ascii_lowercase().as_str() {
            "sha256" => {
                info!("running hash of type sha256");
                sha256_hex(&data)
            }
            "md5" => {
                info!("running hash of type md5");
                md5_hex(&data)
            }
            other => {
                return Err(Error::Config(format!("unknown hash type: {other}")));
            }
        };

        Ok(StaticResult {
            hash,
            hash_type: self.hash_type.to_ascii_lowercase(),
            strings: extract_strings(&data, MIN_STRING_LEN),
            arch: detect_elf_arch(&data)?,
        })
    }
}

/// SHA-256 digest as a lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// MD5 digest as a lowercase hex string.
pub fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Printable ASCII runs of at least `min_len` bytes, with offsets.
pub fn extract_strings(data: &[u8], min_len: usize) -> Vec<StringHit> {
    let mut hits = Vec::new();
    let mut run_start = None;

    for (i, &b) in data.iter().enumerate() {
        let printable = (0x20..=0x7e).contains(&b);
        match (printable, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                if i - start >= min_len {
                    hits.push(StringHit {
                        offset: start as u64,
                        string: String::from_utf8_lossy(&data[start..i]).into_owned(),
                    });
                }
                run_start = None;
            }
            _ => {}
        }
    }

    if let Some(start) = run_start {
        if data.len() - start >= min_len {
            hits.push(StringHit {
                offset: start as u64,
                string: String::from_utf8_lossy(&data[start..]).into_owned(),
            });
        }
    }

    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn md5_of_known_input() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn strings_report_offsets() {
        let data = b"\x00\x01hello\x00\x02world!\x03";
        let hits = extract_strings(data, 4);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].offset, 2);
        assert_eq!(hits[0].string, "hello");
        assert_eq!(hits[1].string, "world!");
    }

    #[test]
    fn short_runs_are_dropped() {
        let data = b"\x00ab\x00cd\x00";
        assert!(extract_strings(data, 4).is_empty());
    }

    #[test]
    fn trailing_run_is_captured() {
        let data = b"\x00trailing";
        let hits = extract_strings(data, 4);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].offset, 1);
    }

    #[test]
    fn unknown_hash_type_is_rejected() {
        let analyzer = StaticAnalyzer::new("crc32");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample");
        std::fs::write(&path, b"\x7fELF").unwrap();
        assert!(analyzer.analyze(&path).is_err());
    }
}
