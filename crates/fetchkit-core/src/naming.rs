//! Filename derivation and destination pathing.
//!
//! Filenames come from `Content-Disposition` (including RFC 5987
//! `filename*`), else the final URL's path basename, else a fixed fallback.
//! The result is sanitized for Linux filesystems and the destination gets a
//! `_2`, `_3`, ... suffix before the extension when the path is taken.

use std::path::{Path, PathBuf};

/// Fallback when neither the URL path nor Content-Disposition yields a name.
const DEFAULT_FILENAME: &str = "unknown_file";

/// Derive a safe local filename from the (redirect-resolved) URL and an
/// optional raw `Content-Disposition` header value.
pub fn derive_filename(url: &str, content_disposition: Option<&str>) -> String {
    let candidate = content_disposition
        .and_then(disposition_filename)
        .filter(|s| !s.is_empty())
        .or_else(|| url_basename(url));

    let raw = match candidate {
        Some(c) => c,
        None => return DEFAULT_FILENAME.to_string(),
    };
    let clean = sanitize(&raw);
    if clean.is_empty() || clean == "." || clean == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        clean
    }
}

/// Last non-empty path segment of the URL, percent-decoded.
fn url_basename(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = percent_decode(segment);
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// Extract the filename parameter from a Content-Disposition value.
/// `filename*=UTF-8''...` (RFC 5987) wins over plain `filename=`.
fn disposition_filename(value: &str) -> Option<String> {
    let mut plain: Option<String> = None;
    for param in value.split(';') {
        let Some((name, v)) = param.split_once('=') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let v = v.trim();
        if name == "filename*" {
            let rest = v
                .strip_prefix("UTF-8''")
                .or_else(|| v.strip_prefix("utf-8''"))?;
            let decoded = percent_decode(rest);
            if !decoded.is_empty() {
                return Some(decoded);
            }
        } else if name == "filename" {
            let unquoted = if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
                unescape_quoted(&v[1..v.len() - 1])
            } else {
                v.to_string()
            };
            if !unquoted.is_empty() {
                plain = Some(unquoted);
            }
        }
    }
    plain
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(n @ ('"' | '\\')) => out.push(n),
                Some(n) => {
                    out.push(c);
                    out.push(n);
                }
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Strip path separators and control characters; trim leading/trailing dots
/// and whitespace so the name cannot escape its directory or hide itself.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|&c| c != '/' && c != '\0' && !c.is_control())
        .collect();
    cleaned
        .trim_matches(|c: char| c.is_whitespace() || c == '.')
        .to_string()
}

/// First free path for `filename` under `dir`: the name itself, else
/// `stem_2.ext`, `stem_3.ext`, ...
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let direct = dir.join(filename);
    if !direct.exists() {
        return direct;
    }
    let (stem, ext) = split_extension(filename);
    for n in 2.. {
        let candidate = if ext.is_empty() {
            dir.join(format!("{}_{}", stem, n))
        } else {
            dir.join(format!("{}_{}.{}", stem, n, ext))
        };
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (filename, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_url_path() {
        assert_eq!(
            derive_filename("https://example.com/pub/archive.zip", None),
            "archive.zip"
        );
        assert_eq!(
            derive_filename("https://cdn.example.com/a/b/image%20one.png", None),
            "image one.png"
        );
    }

    #[test]
    fn filename_from_disposition_beats_url() {
        assert_eq!(
            derive_filename(
                "https://example.com/dl?id=42",
                Some("attachment; filename=\"report.pdf\"")
            ),
            "report.pdf"
        );
        assert_eq!(
            derive_filename(
                "https://example.com/x.bin",
                Some("attachment; filename=plain.bin")
            ),
            "plain.bin"
        );
    }

    #[test]
    fn rfc5987_filename_star_wins() {
        assert_eq!(
            derive_filename(
                "https://example.com/x",
                Some("attachment; filename=\"fallback.txt\"; filename*=UTF-8''na%C3%AFve.txt")
            ),
            "naïve.txt"
        );
    }

    #[test]
    fn empty_path_falls_back() {
        assert_eq!(derive_filename("https://example.com/", None), "unknown_file");
        assert_eq!(derive_filename("https://example.com", None), "unknown_file");
    }

    #[test]
    fn sanitize_strips_separators_and_dots() {
        assert_eq!(derive_filename("https://e.com/..", None), "unknown_file");
        assert_eq!(
            derive_filename(
                "https://e.com/x",
                Some("attachment; filename=\"../etc/evil\u{0}name\"")
            ),
            "etcevilname"
        );
    }

    #[test]
    fn unique_path_suffixes_before_extension() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = unique_path(dir.path(), "file.tar.gz");
        assert_eq!(p1, dir.path().join("file.tar.gz"));
        std::fs::write(&p1, b"x").unwrap();
        let p2 = unique_path(dir.path(), "file.tar.gz");
        assert_eq!(p2, dir.path().join("file.tar_2.gz"));
        std::fs::write(&p2, b"x").unwrap();
        let p3 = unique_path(dir.path(), "file.tar.gz");
        assert_eq!(p3, dir.path().join("file.tar_3.gz"));
    }

    #[test]
    fn unique_path_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob"), b"x").unwrap();
        assert_eq!(
            unique_path(dir.path(), "blob"),
            dir.path().join("blob_2")
        );
    }
}
