//! `start_download` options map parsing.
//!
//! The options argument is a flat string map so control surfaces can pass it
//! through untyped. Recognized keys: `headers_json`, `cookies_json`,
//! `start_time`, `category`, `priority`, `expected_hash`, `hash_algorithm`.
//! Unknown keys are ignored with a warning.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::task::Priority;
use crate::verify::HashAlgorithm;

const RECOGNIZED: &[&str] = &[
    "headers_json",
    "cookies_json",
    "start_time",
    "category",
    "priority",
    "expected_hash",
    "hash_algorithm",
];

/// Structured cookie entry accepted in `cookies_json`.
#[derive(Debug, Deserialize)]
struct CookieSpec {
    name: String,
    value: String,
    #[serde(default)]
    #[allow(dead_code)]
    domain: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    path: Option<String>,
}

/// Parsed options, ready to build a `NewTask`.
#[derive(Debug, Default)]
pub struct StartOptions {
    pub headers: HashMap<String, String>,
    pub cookie: Option<String>,
    pub start_time: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub category: String,
    pub priority: Priority,
    pub expected_hash: Option<String>,
    pub hash_algorithm: Option<HashAlgorithm>,
}

pub fn parse_options(options: &HashMap<String, String>) -> Result<StartOptions> {
    let mut out = StartOptions::default();
    for key in options.keys() {
        if !RECOGNIZED.contains(&key.as_str()) {
            tracing::warn!(key, "ignoring unrecognized start_download option");
        }
    }

    if let Some(raw) = options.get("headers_json") {
        out.headers = serde_json::from_str(raw).context("headers_json is not a JSON object")?;
    }
    if let Some(raw) = options.get("cookies_json") {
        out.cookie = Some(parse_cookies(raw));
    }
    if let Some(raw) = options.get("start_time") {
        let at = DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("start_time is not RFC3339: {raw}"))?
            .with_timezone(&Utc);
        out.start_at = Some(at);
        out.start_time = Some(raw.clone());
    }
    if let Some(c) = options.get("category") {
        out.category = c.clone();
    }
    if let Some(p) = options.get("priority") {
        out.priority = Priority::from_str(p);
    }
    if let Some(h) = options.get("expected_hash") {
        out.expected_hash = Some(h.clone());
    }
    if let Some(a) = options.get("hash_algorithm") {
        match HashAlgorithm::from_str(a) {
            Some(algo) => out.hash_algorithm = Some(algo),
            None => bail!("unsupported hash_algorithm: {a}"),
        }
    }
    if out.expected_hash.is_some() && out.hash_algorithm.is_none() {
        // Default by digest length: 64 hex chars is SHA-256, 32 is MD5.
        let len = out.expected_hash.as_deref().unwrap_or("").trim().len();
        out.hash_algorithm = match len {
            64 => Some(HashAlgorithm::Sha256),
            32 => Some(HashAlgorithm::Md5),
            _ => bail!("expected_hash needs hash_algorithm (unrecognized digest length {len})"),
        };
    }
    Ok(out)
}

/// `cookies_json` is a JSON array of `{name, value, ...}`; anything that does
/// not parse as one is taken verbatim as a raw `Cookie:` header value.
fn parse_cookies(raw: &str) -> String {
    match serde_json::from_str::<Vec<CookieSpec>>(raw) {
        Ok(cookies) => cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; "),
        Err(_) => raw.trim().to_string(),
    }
}
