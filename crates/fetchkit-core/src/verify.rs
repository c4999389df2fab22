//! Streamed integrity verification of finished downloads.
//!
//! Hashing runs after the transfer, never inline with segment writes, so it
//! cannot slow the hot path.

use anyhow::{Context, Result};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Md5,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Md5 => "md5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(HashAlgorithm::Sha256),
            "md5" => Some(HashAlgorithm::Md5),
            _ => None,
        }
    }
}

/// Compute the digest of a file as lowercase hex, reading in 64 KiB chunks.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    match algorithm {
        HashAlgorithm::Sha256 => digest_reader::<Sha256>(&mut f, path),
        HashAlgorithm::Md5 => digest_reader::<Md5>(&mut f, path),
    }
}

fn digest_reader<D: Digest>(f: &mut File, path: &Path) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// True if the file's digest equals `expected` (hex, case-insensitive).
pub fn verify_file(path: &Path, algorithm: HashAlgorithm, expected: &str) -> Result<bool> {
    let actual = hash_file(path, algorithm)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sha256_of_empty_file() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            hash_file(f.path(), HashAlgorithm::Sha256).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn md5_of_known_content() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello\n").unwrap();
        f.flush().unwrap();
        assert_eq!(
            hash_file(f.path(), HashAlgorithm::Md5).unwrap(),
            "b1946ac92492d2347c6235b4d2611184"
        );
    }

    #[test]
    fn verify_is_case_insensitive() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello\n").unwrap();
        f.flush().unwrap();
        assert!(verify_file(
            f.path(),
            HashAlgorithm::Md5,
            "B1946AC92492D2347C6235B4D2611184"
        )
        .unwrap());
        assert!(!verify_file(f.path(), HashAlgorithm::Md5, "00000000000000000000000000000000").unwrap());
    }

    #[test]
    fn algorithm_string_roundtrip() {
        assert_eq!(HashAlgorithm::from_str("sha256"), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_str("md5"), Some(HashAlgorithm::Md5));
        assert_eq!(HashAlgorithm::from_str("crc32"), None);
    }
}
