//! Destination allocation: free-space check and exact-size preallocation.

use std::path::Path;

use thiserror::Error;

use crate::storage::FileWriter;

/// Safety margin kept free on the target filesystem beyond the file itself.
pub const FREE_SPACE_MARGIN: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("not enough disk space: need {needed} bytes, {free} free")]
    DiskFull { needed: u64, free: u64 },
    #[error("allocate destination: {0}")]
    Io(#[from] std::io::Error),
}

/// Create (or reopen for resume) the destination sized to exactly `size`
/// bytes. Fails with `DiskFull` unless `free >= size + margin`.
///
/// `resume` reopens without truncating; previously written ranges survive.
pub fn prepare(path: &Path, size: u64, margin: u64, resume: bool) -> Result<FileWriter, AllocError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    if let Some(free) = free_space(dir) {
        let existing = if resume {
            std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        let needed = size.saturating_sub(existing) + margin;
        if free < needed {
            return Err(AllocError::DiskFull { needed, free });
        }
    }

    let writer = if resume && path.exists() {
        FileWriter::reopen(path, size)?
    } else {
        FileWriter::create(path, size)?
    };
    Ok(writer)
}

/// Free bytes available to unprivileged writes on the filesystem holding
/// `dir`. `None` when the platform gives no answer; allocation then proceeds
/// and real exhaustion surfaces as a write error.
#[cfg(unix)]
pub fn free_space(dir: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c = std::ffi::CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let r = unsafe { libc::statvfs(c.as_ptr(), &mut stat) };
    if r != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn free_space(_dir: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_sizes_file_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dest.bin");
        let w = prepare(&path, 4096, 0, false).unwrap();
        drop(w);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn prepare_resume_keeps_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dest.bin");
        let w = prepare(&path, 8, 0, false).unwrap();
        w.write_at(0, b"keepme!!").unwrap();
        drop(w);

        let _w2 = prepare(&path, 8, 0, true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"keepme!!");
    }

    #[cfg(unix)]
    #[test]
    fn absurd_size_reports_disk_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dest.bin");
        let r = prepare(&path, u64::MAX / 4, FREE_SPACE_MARGIN, false);
        assert!(matches!(r, Err(AllocError::DiskFull { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn free_space_reports_something() {
        let dir = tempfile::tempdir().unwrap();
        assert!(free_space(dir.path()).unwrap() > 0);
    }
}
