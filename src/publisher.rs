//! Uploads assets and the finished document, once each.
use std::collections::HashSet;

use crate::archive::{ArchiveDocument, AssetIndex, AssetRef};
use crate::error::UploadError;
use crate::transport::BlobTransport;

/// File name the archive document is published under.
pub const DOCUMENT_NAME: &str = "chatlog.json";

/// Something the user should see after the run, e.g. a failed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub asset: String,
    pub message: String,
}

/// Asset key of a server-relative path: its final segment.
pub fn asset_key(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub struct AssetPublisher<T> {
    transport: T,
    notices: Vec<Notice>,
    /// Names whose upload already failed; they are not tried again.
    failed: HashSet<String>,
}

impl<T: BlobTransport> AssetPublisher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            notices: Vec::new(),
            failed: HashSet::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Upload a server-side file without touching any asset index.
    ///
    /// Failures are logged and noted before being returned. A name that
    /// failed once is not sent again and yields [`UploadError::AlreadyFailed`].
    pub fn upload_file(&mut self, path: &str, name: &str) -> Result<String, UploadError> {
        if self.failed.contains(name) {
            tracing::debug!(name, "upload failed earlier, not retrying");
            return Err(UploadError::AlreadyFailed(name.to_string()));
        }
        self.transport
            .upload_local_file(path, name)
            .inspect_err(|err| {
                self.failed.insert(name.to_string());
                self.report(name, err);
            })
    }

    /// Reference for `local_path`, uploading it only if its key is not yet indexed.
    pub fn resolve_asset(
        &mut self,
        index: &mut AssetIndex,
        local_path: &str,
    ) -> Result<AssetRef, UploadError> {
        let key = asset_key(local_path);
        if index.contains(key) {
            tracing::debug!(key, "asset already indexed");
            return Ok(AssetRef::new(key));
        }
        let url = self.upload_file(local_path, key)?;
        Ok(index.register(key, url))
    }

    /// Serialise and upload the finished document, returning its URL.
    pub fn publish_document(&mut self, document: &ArchiveDocument) -> Result<String, UploadError> {
        let bytes = document
            .to_json_bytes()
            .map_err(|e| UploadError::Encoding(e.to_string()))?;
        tracing::debug!(
            records = document.chat.len(),
            assets = document.image_mappings.len(),
            bytes = bytes.len(),
            "publishing chatlog"
        );
        self.transport
            .upload_bytes(bytes, DOCUMENT_NAME)
            .inspect_err(|err| tracing::error!(error = %err, "error uploading chatlog JSON"))
    }

    fn report(&mut self, name: &str, err: &UploadError) {
        match err.notice(name) {
            Some(message) => {
                tracing::error!(name, error = %err, "failed to upload file");
                self.notices.push(Notice {
                    asset: name.to_string(),
                    message,
                });
            }
            None => tracing::debug!(name, error = %err, "upload skipped"),
        }
    }
}
