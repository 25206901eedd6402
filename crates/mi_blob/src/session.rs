//! Resumable transfer sessions.
//!
//! The relay stores the sealed blob as opaque bytes; these structs track the
//! client-side cursor so an interrupted transfer resumes with the same
//! `upload_id`/`download_id` instead of restarting. A successfully
//! transferred prefix survives errors on purpose.

use crate::error::BlobError;
use crate::{MAX_WIRE, TRANSFER_UNIT};

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub file_id: String,
    pub upload_id: String,
    blob: Vec<u8>,
    offset: usize,
}

impl UploadSession {
    pub fn new(file_id: String, upload_id: String, blob: Vec<u8>) -> Result<Self, BlobError> {
        if blob.len() as u64 > MAX_WIRE {
            return Err(BlobError::TooLarge(blob.len() as u64));
        }
        Ok(Self {
            file_id,
            upload_id,
            blob,
            offset: 0,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.blob.len() as u64
    }

    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    pub fn is_complete(&self) -> bool {
        self.offset == self.blob.len()
    }

    /// Next slice to push, at most one transfer unit.
    pub fn next_chunk(&self) -> Option<(u64, &[u8])> {
        if self.is_complete() {
            return None;
        }
        let end = (self.offset + TRANSFER_UNIT).min(self.blob.len());
        Some((self.offset as u64, &self.blob[self.offset..end]))
    }

    /// Advance past `len` bytes the relay acknowledged.
    pub fn mark_sent(&mut self, len: usize) -> Result<(), BlobError> {
        if self.is_complete() {
            return Err(BlobError::TransferComplete);
        }
        if len > self.blob.len() - self.offset {
            return Err(BlobError::BadOffset);
        }
        self.offset += len;
        Ok(())
    }

    /// Rewind to a server-reported offset after reconnecting (resume).
    pub fn seek(&mut self, offset: u64) -> Result<(), BlobError> {
        if offset > self.blob.len() as u64 {
            return Err(BlobError::BadOffset);
        }
        self.offset = offset as usize;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub file_id: String,
    pub download_id: String,
    expected_size: u64,
    buf: Vec<u8>,
}

impl DownloadSession {
    pub fn new(file_id: String, download_id: String, expected_size: u64) -> Result<Self, BlobError> {
        if expected_size > MAX_WIRE {
            return Err(BlobError::TooLarge(expected_size));
        }
        Ok(Self {
            file_id,
            download_id,
            expected_size,
            buf: Vec::with_capacity(expected_size.min(TRANSFER_UNIT as u64) as usize),
        })
    }

    pub fn offset(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    /// How many bytes to request next, at most one transfer unit.
    pub fn next_request_len(&self) -> Option<u32> {
        let remaining = self.expected_size.saturating_sub(self.buf.len() as u64);
        if remaining == 0 {
            return None;
        }
        Some(remaining.min(TRANSFER_UNIT as u64) as u32)
    }

    /// Append bytes returned for the current offset.
    pub fn push_chunk(&mut self, offset: u64, bytes: &[u8], eof: bool) -> Result<(), BlobError> {
        if offset != self.buf.len() as u64 {
            return Err(BlobError::BadOffset);
        }
        if self.buf.len() as u64 + bytes.len() as u64 > self.expected_size {
            return Err(BlobError::BadOffset);
        }
        self.buf.extend_from_slice(bytes);
        if eof && (self.buf.len() as u64) < self.expected_size {
            return Err(BlobError::SizeMismatch);
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.buf.len() as u64 == self.expected_size
    }

    pub fn into_blob(self) -> Result<Vec<u8>, BlobError> {
        if !self.is_complete() {
            return Err(BlobError::SizeMismatch);
        }
        Ok(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_walks_in_transfer_units() {
        let blob = vec![1u8; TRANSFER_UNIT + 100];
        let mut up = UploadSession::new("f".into(), "u".into(), blob).unwrap();
        let (off, chunk) = up.next_chunk().unwrap();
        assert_eq!(off, 0);
        assert_eq!(chunk.len(), TRANSFER_UNIT);
        up.mark_sent(chunk.len()).unwrap();
        let (off, chunk) = up.next_chunk().unwrap();
        assert_eq!(off, TRANSFER_UNIT as u64);
        assert_eq!(chunk.len(), 100);
        up.mark_sent(100).unwrap();
        assert!(up.is_complete());
        assert!(up.next_chunk().is_none());
    }

    #[test]
    fn upload_resume_rewinds() {
        let mut up = UploadSession::new("f".into(), "u".into(), vec![0u8; 1000]).unwrap();
        up.mark_sent(1000).unwrap();
        up.seek(400).unwrap();
        let (off, chunk) = up.next_chunk().unwrap();
        assert_eq!(off, 400);
        assert_eq!(chunk.len(), 600);
        assert!(up.seek(2000).is_err());
    }

    #[test]
    fn download_requires_contiguous_offsets() {
        let mut down = DownloadSession::new("f".into(), "d".into(), 10).unwrap();
        down.push_chunk(0, &[1, 2, 3], false).unwrap();
        assert!(down.push_chunk(5, &[9], false).is_err());
        down.push_chunk(3, &[4, 5, 6, 7, 8, 9, 10], true).unwrap();
        assert!(down.is_complete());
        assert_eq!(down.into_blob().unwrap().len(), 10);
    }

    #[test]
    fn premature_eof_rejected() {
        let mut down = DownloadSession::new("f".into(), "d".into(), 10).unwrap();
        assert!(down.push_chunk(0, &[1, 2], true).is_err());
    }
}
