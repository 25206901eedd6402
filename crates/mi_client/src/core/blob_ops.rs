//! E2EE file-blob transfer.
//!
//! The relay is a dumb store for sealed blobs; AEAD MACs catch any
//! tampering on the way back. Small files go up in one request; larger
//! ones stream in transfer-unit slices through a resumable session whose
//! server-side prefix survives client errors (the one sanctioned exception
//! to roll-back-on-error).

use rand::RngCore;

use mi_blob::session::{DownloadSession, UploadSession};
use mi_blob::{self, BlobError};
use mi_proto::frame::FrameType;
use mi_proto::wire::{self, Reader};

use crate::core::ClientCore;
use crate::error::ClientError;

impl ClientCore {
    /// Single-shot upload (plaintext ≤ 8 MiB). Returns `(file_id, key,
    /// plaintext size)` for embedding into a File envelope.
    pub fn upload_e2ee_file_blob(
        &mut self,
        name: &str,
        plaintext: &[u8],
    ) -> Result<(String, [u8; 32], u64), ClientError> {
        if plaintext.len() as u64 > mi_blob::SINGLE_SHOT_MAX {
            return Err(ClientError::InvalidInput(
                "file too large for single-shot upload; use the chunked session".into(),
            ));
        }
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        let blob = mi_blob::encrypt_auto(plaintext, &key, name)?;

        let mut payload = Vec::new();
        wire::write_bytes(&blob, &mut payload)?;
        let response = self.process_encrypted(FrameType::BlobUpload, &payload)?;
        let mut r = Reader::new(&response);
        let file_id = r.read_string()?;
        r.finish()?;
        Ok((file_id, key, plaintext.len() as u64))
    }

    /// Begin a chunked upload. Returns the session plus the blob key.
    pub fn start_e2ee_file_blob_upload(
        &mut self,
        name: &str,
        plaintext: &[u8],
    ) -> Result<(UploadSession, [u8; 32]), ClientError> {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        let blob = mi_blob::encrypt_auto(plaintext, &key, name)?;

        let mut payload = Vec::new();
        wire::write_u64(blob.len() as u64, &mut payload);
        let response = self.process_encrypted(FrameType::BlobUploadStart, &payload)?;
        let mut r = Reader::new(&response);
        let file_id = r.read_string()?;
        let upload_id = r.read_string()?;
        r.finish()?;

        Ok((UploadSession::new(file_id, upload_id, blob)?, key))
    }

    /// Push the next transfer unit. Returns true when the upload is done
    /// (call [`ClientCore::finish_e2ee_file_blob_upload`]). The server
    /// reports its total received count, which doubles as the resume
    /// cursor after a reconnect.
    pub fn upload_e2ee_file_blob_chunk(
        &mut self,
        session: &mut UploadSession,
    ) -> Result<bool, ClientError> {
        let Some((offset, chunk)) = session.next_chunk() else {
            return Ok(true);
        };
        let mut payload = Vec::new();
        wire::write_string(&session.file_id, &mut payload)?;
        wire::write_string(&session.upload_id, &mut payload)?;
        wire::write_u64(offset, &mut payload);
        wire::write_bytes(chunk, &mut payload)?;
        let chunk_len = chunk.len();
        let response = self.process_encrypted(FrameType::BlobUploadChunk, &payload)?;
        let mut r = Reader::new(&response);
        let received = r.read_u64()?;
        r.finish()?;

        if received == offset + chunk_len as u64 {
            session.mark_sent(chunk_len).map_err(blob_err)?;
        } else {
            // Server and client disagree; trust its cursor and resume there.
            session.seek(received).map_err(blob_err)?;
        }
        Ok(session.is_complete())
    }

    pub fn finish_e2ee_file_blob_upload(
        &mut self,
        session: &UploadSession,
    ) -> Result<(), ClientError> {
        if !session.is_complete() {
            return Err(ClientError::InvalidInput("upload not complete".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(&session.file_id, &mut payload)?;
        wire::write_string(&session.upload_id, &mut payload)?;
        wire::write_u64(session.total_size(), &mut payload);
        self.process_encrypted(FrameType::BlobUploadFinish, &payload)?;
        Ok(())
    }

    /// Single-shot download and decrypt.
    pub fn download_e2ee_file_blob(
        &mut self,
        file_id: &str,
        key: &[u8; 32],
        wipe_after_read: bool,
    ) -> Result<Vec<u8>, ClientError> {
        if file_id.is_empty() {
            return Err(ClientError::InvalidInput("file id empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(file_id, &mut payload)?;
        wire::write_u8(u8::from(wipe_after_read), &mut payload);
        let response = self.process_encrypted(FrameType::BlobDownload, &payload)?;
        let mut r = Reader::new(&response);
        let blob = r.read_bytes()?;
        r.finish()?;
        Ok(mi_blob::decrypt_auto(&blob, key)?)
    }

    pub fn start_e2ee_file_blob_download(
        &mut self,
        file_id: &str,
        wipe_after_read: bool,
    ) -> Result<DownloadSession, ClientError> {
        if file_id.is_empty() {
            return Err(ClientError::InvalidInput("file id empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(file_id, &mut payload)?;
        wire::write_u8(u8::from(wipe_after_read), &mut payload);
        let response = self.process_encrypted(FrameType::BlobDownloadStart, &payload)?;
        let mut r = Reader::new(&response);
        let download_id = r.read_string()?;
        let size = r.read_u64()?;
        r.finish()?;
        Ok(DownloadSession::new(file_id.to_string(), download_id, size)?)
    }

    /// Pull the next transfer unit; true when the blob is fully here.
    pub fn download_e2ee_file_blob_chunk(
        &mut self,
        session: &mut DownloadSession,
    ) -> Result<bool, ClientError> {
        let Some(max_len) = session.next_request_len() else {
            return Ok(true);
        };
        let offset = session.offset();
        let mut payload = Vec::new();
        wire::write_string(&session.file_id, &mut payload)?;
        wire::write_string(&session.download_id, &mut payload)?;
        wire::write_u64(offset, &mut payload);
        wire::write_u32(max_len, &mut payload);
        let response = self.process_encrypted(FrameType::BlobDownloadChunk, &payload)?;
        let mut r = Reader::new(&response);
        let bytes = r.read_bytes()?;
        let eof = r.read_u8()? != 0;
        r.finish()?;

        session.push_chunk(offset, &bytes, eof).map_err(blob_err)?;
        Ok(session.is_complete())
    }

    /// Decode any blob version, dispatching on the header bytes.
    pub fn decrypt_file_blob(blob: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, ClientError> {
        Ok(mi_blob::decrypt_auto(blob, key)?)
    }
}

fn blob_err(e: BlobError) -> ClientError {
    e.into()
}
