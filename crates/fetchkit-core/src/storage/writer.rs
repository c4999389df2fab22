//! Shared destination file handle.
//!
//! Ranged downloads size the file up front, so parallel positioned writes
//! never race on length; the unknown-length single-stream fallback starts at
//! zero and extends as it writes. Errors stay at the `io::Result` level here
//! and get their context from the allocator, which owns the user-facing
//! failure story.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Handle to the destination file, shared by all workers of a task. Clones
/// are cheap and write independently.
#[derive(Clone)]
pub struct FileWriter {
    file: Arc<File>,
    path: PathBuf,
    #[cfg(not(unix))]
    write_lock: Arc<std::sync::Mutex<()>>,
}

impl FileWriter {
    /// Create (or truncate) the destination sized to exactly `size` bytes.
    ///
    /// The length comes from `set_len`, leaving the file sparse until bytes
    /// land. On Linux the blocks are additionally reserved up front so an
    /// ENOSPC surfaces here rather than mid-transfer; elsewhere, or when the
    /// filesystem refuses, the sparse file alone is enough.
    pub fn create(path: &Path, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        reserve_blocks(&file, size);
        Ok(Self::wrap(file, path))
    }

    /// Reopen an existing destination for resume. Bytes already on disk are
    /// kept; a file that shrank since the last run is grown back to `size`
    /// so positioned writes never outrun the length.
    pub fn reopen(path: &Path, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() != size {
            file.set_len(size)?;
        }
        Ok(Self::wrap(file, path))
    }

    fn wrap(file: File, path: &Path) -> Self {
        FileWriter {
            file: Arc::new(file),
            path: path.to_path_buf(),
            #[cfg(not(unix))]
            write_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    /// Write the whole buffer at `offset`. Cursor-free, so concurrent calls
    /// from different workers cannot interleave badly.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    /// Platforms without pwrite serialize seek+write pairs behind a mutex.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let _guard = self.write_lock.lock().unwrap();
        let mut f = &*self.file;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }

    /// Push written payload to disk. The length was settled at creation, so
    /// a data-only sync covers everything the resume bitfield may claim.
    pub fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reserve real blocks for the file on filesystems that support it.
#[cfg(target_os = "linux")]
fn reserve_blocks(file: &File, size: u64) {
    use std::os::unix::io::AsRawFd;
    if size == 0 {
        return;
    }
    let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, size as libc::off_t) };
    if rc != 0 {
        let errno = io::Error::last_os_error();
        tracing::debug!(%errno, "block reservation skipped, keeping sparse file");
    }
}

#[cfg(not(target_os = "linux"))]
fn reserve_blocks(_file: &File, _size: u64) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_all(path: &Path) -> Vec<u8> {
        let mut buf = Vec::new();
        File::open(path).unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn create_sizes_file_and_takes_positioned_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let w = FileWriter::create(&path, 64).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);

        w.write_at(60, b"tail").unwrap();
        w.write_at(0, b"head").unwrap();
        w.write_at(30, b"middle").unwrap();
        w.flush().unwrap();

        let buf = read_all(&path);
        assert_eq!(buf.len(), 64);
        assert_eq!(&buf[0..4], b"head");
        assert_eq!(&buf[30..36], b"middle");
        assert_eq!(&buf[60..64], b"tail");
    }

    #[test]
    fn clones_share_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let a = FileWriter::create(&path, 16).unwrap();
        let b = a.clone();
        a.write_at(0, b"aaaaaaaa").unwrap();
        b.write_at(8, b"bbbbbbbb").unwrap();
        assert_eq!(read_all(&path), b"aaaaaaaabbbbbbbb");
    }

    #[test]
    fn reopen_keeps_bytes_and_restores_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        FileWriter::create(&path, 8)
            .unwrap()
            .write_at(0, b"keepme!!")
            .unwrap();

        // Something truncated the file between runs; reopen must grow it
        // back so offsets stay writable.
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(4)
            .unwrap();
        let w = FileWriter::reopen(&path, 8).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
        w.write_at(4, b"AB").unwrap();

        let buf = read_all(&path);
        assert_eq!(&buf[0..4], b"keep");
        assert_eq!(&buf[4..6], b"AB");
    }

    #[test]
    fn zero_size_create_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        let w = FileWriter::create(&path, 0).unwrap();
        w.flush().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn reopen_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileWriter::reopen(&dir.path().join("absent"), 8).is_err());
    }
}
