//! Resume state: validators plus a part-completion bitfield.
//!
//! `ResumeState` is the opaque `meta` blob on a task record. It is the only
//! thing needed to continue an interrupted transfer: the remote validators
//! captured at first probe and one bit per part marking durably written
//! ranges. Serialized with a small versioned binary codec.

mod bitfield;

pub use bitfield::PartBitfield;

use thiserror::Error;

/// Current on-disk codec version.
pub const RESUME_VERSION: u8 = 2;

/// Persisted continuation record for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    /// ETag captured at first probe; empty = server sent none.
    pub etag: String,
    /// Last-Modified captured at first probe; empty = server sent none.
    pub last_modified: String,
    pub total_size: u64,
    pub num_parts: u32,
    pub bitfield: PartBitfield,
}

/// Decode failure: the blob is rejected wholesale and the transfer restarts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("resume blob truncated")]
    Truncated,
    #[error("unsupported resume version {0}")]
    UnsupportedVersion(u8),
    #[error("resume blob has {extra} trailing bytes")]
    TrailingBytes { extra: usize },
    #[error("bitfield marks part {index} beyond num_parts {num_parts}")]
    BitOutOfRange { index: u32, num_parts: u32 },
}

impl ResumeState {
    pub fn new(etag: String, last_modified: String, total_size: u64, num_parts: u32) -> Self {
        Self {
            etag,
            last_modified,
            total_size,
            num_parts,
            bitfield: PartBitfield::new(num_parts as usize),
        }
    }

    /// Serialize to the compact binary form.
    ///
    /// Layout: version u8, total_size u64 LE, num_parts u32 LE, etag
    /// (u16 LE length + bytes), last_modified (u16 LE length + bytes),
    /// bitfield (exactly ceil(num_parts/8) bytes, LSB-first).
    pub fn encode(&self) -> Vec<u8> {
        let etag = self.etag.as_bytes();
        let lm = self.last_modified.as_bytes();
        let bits = self.bitfield.to_bytes(self.num_parts as usize);
        let mut out = Vec::with_capacity(1 + 8 + 4 + 2 + etag.len() + 2 + lm.len() + bits.len());
        out.push(RESUME_VERSION);
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&self.num_parts.to_le_bytes());
        out.extend_from_slice(&(etag.len() as u16).to_le_bytes());
        out.extend_from_slice(etag);
        out.extend_from_slice(&(lm.len() as u16).to_le_bytes());
        out.extend_from_slice(lm);
        out.extend_from_slice(&bits);
        out
    }

    /// Decode and validate a blob previously produced by `encode`.
    pub fn decode(blob: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader { buf: blob, pos: 0 };
        let version = r.u8()?;
        if version != RESUME_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let total_size = r.u64()?;
        let num_parts = r.u32()?;
        let etag = r.string()?;
        let last_modified = r.string()?;
        let expected = (num_parts as usize + 7) / 8;
        let bits = r.take(expected)?;
        if r.pos != blob.len() {
            return Err(CodecError::TrailingBytes {
                extra: blob.len() - r.pos,
            });
        }
        let bitfield = PartBitfield::from_bytes(bits, num_parts as usize);
        if let Some(index) = bitfield.first_set_at_or_beyond(num_parts as usize) {
            return Err(CodecError::BitOutOfRange {
                index: index as u32,
                num_parts,
            });
        }
        Ok(Self {
            etag,
            last_modified,
            total_size,
            num_parts,
            bitfield,
        })
    }

    /// True if the persisted validators still match the remote ones.
    ///
    /// An empty persisted validator carries no opinion; a non-empty one must
    /// match exactly or the resume is invalid and progress is discarded.
    pub fn validators_match(
        &self,
        remote_etag: Option<&str>,
        remote_last_modified: Option<&str>,
    ) -> bool {
        if !self.etag.is_empty() && remote_etag != Some(self.etag.as_str()) {
            return false;
        }
        if !self.last_modified.is_empty()
            && remote_last_modified != Some(self.last_modified.as_str())
        {
            return false;
        }
        true
    }

    /// Bytes covered by completed parts, given the 1 MiB chunking.
    pub fn completed_bytes(&self, chunk_size: u64) -> u64 {
        let n = self.num_parts as usize;
        let mut total = 0u64;
        for i in 0..n {
            if self.bitfield.is_complete(i) {
                let start = i as u64 * chunk_size;
                let end = ((i as u64 + 1) * chunk_size).min(self.total_size);
                total += end.saturating_sub(start);
            }
        }
        total
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let s = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let b = self.take(2)?;
        let len = u16::from_le_bytes([b[0], b[1]]) as usize;
        let s = self.take(len)?;
        Ok(String::from_utf8_lossy(s).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(num_parts: u32) -> ResumeState {
        let mut s = ResumeState::new(
            "\"abc-123\"".to_string(),
            "Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
            10 * 1024 * 1024,
            num_parts,
        );
        s.bitfield.set_complete(0);
        s.bitfield.set_complete(3);
        s
    }

    #[test]
    fn encode_decode_roundtrip() {
        let s = sample(10);
        let blob = s.encode();
        let back = ResumeState::decode(&blob).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn roundtrip_empty_validators() {
        let s = ResumeState::new(String::new(), String::new(), 0, 1);
        let back = ResumeState::decode(&s.encode()).unwrap();
        assert_eq!(back.etag, "");
        assert_eq!(back.last_modified, "");
        assert_eq!(back.num_parts, 1);
    }

    #[test]
    fn roundtrip_large_bitfield() {
        let n = 50_000u32;
        let mut s = ResumeState::new("e".into(), String::new(), n as u64 * 1024, n);
        for i in (0..n as usize).step_by(7) {
            s.bitfield.set_complete(i);
        }
        let back = ResumeState::decode(&s.encode()).unwrap();
        for i in 0..n as usize {
            assert_eq!(back.bitfield.is_complete(i), i % 7 == 0);
        }
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut blob = sample(4).encode();
        blob[0] = 1;
        assert_eq!(
            ResumeState::decode(&blob),
            Err(CodecError::UnsupportedVersion(1))
        );
    }

    #[test]
    fn decode_rejects_truncation_and_trailing() {
        let blob = sample(4).encode();
        assert_eq!(
            ResumeState::decode(&blob[..blob.len() - 1]),
            Err(CodecError::Truncated)
        );
        let mut longer = blob.clone();
        longer.push(0);
        assert_eq!(
            ResumeState::decode(&longer),
            Err(CodecError::TrailingBytes { extra: 1 })
        );
    }

    #[test]
    fn decode_rejects_ghost_bits() {
        // 3 parts -> one byte, but bit 3 set.
        let mut s = ResumeState::new(String::new(), String::new(), 3 * 1024, 3);
        s.bitfield.set_complete(0);
        let mut blob = s.encode();
        let last = blob.len() - 1;
        blob[last] |= 1 << 3;
        assert!(matches!(
            ResumeState::decode(&blob),
            Err(CodecError::BitOutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn validators_empty_is_no_opinion() {
        let s = ResumeState::new(String::new(), String::new(), 100, 1);
        assert!(s.validators_match(Some("anything"), None));
        assert!(s.validators_match(None, Some("whenever")));
    }

    #[test]
    fn validators_mismatch_invalidates() {
        let s = sample(4);
        assert!(s.validators_match(
            Some("\"abc-123\""),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        ));
        assert!(!s.validators_match(Some("\"other\""), Some("Wed, 21 Oct 2015 07:28:00 GMT")));
        assert!(!s.validators_match(Some("\"abc-123\""), Some("Thu, 22 Oct 2015 08:00:00 GMT")));
        assert!(!s.validators_match(None, Some("Wed, 21 Oct 2015 07:28:00 GMT")));
    }

    #[test]
    fn completed_bytes_counts_short_last_part() {
        let chunk = 1024 * 1024u64;
        let mut s = ResumeState::new(String::new(), String::new(), chunk + 1, 2);
        s.bitfield.set_complete(0);
        assert_eq!(s.completed_bytes(chunk), chunk);
        s.bitfield.set_complete(1);
        assert_eq!(s.completed_bytes(chunk), chunk + 1);
    }
}
