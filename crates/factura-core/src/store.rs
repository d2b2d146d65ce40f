//! Document store boundary.
//!
//! Persisted document/user storage is an external collaborator; the pipeline
//! only needs the small contract below. [`MemoryStore`] implements it
//! in-process for the default wiring and for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    CanonicalExtractionResult, DocumentStatus, EmailAttachment, FileType, ValidationFlags,
};

/// A document materialized from an attachment, ready to enqueue.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub document_id: String,
    pub file_path: PathBuf,
    pub file_type: FileType,
    pub file_name: String,
}

/// Contract to the external document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist an email attachment as a new document owned by `user_id`.
    async fn create_from_attachment(
        &self,
        user_id: &str,
        email_id: &str,
        attachment: &EmailAttachment,
    ) -> Result<StoredDocument>;

    async fn set_status(&self, document_id: &str, status: DocumentStatus) -> Result<()>;

    /// Write extraction result and validation flags back as a single atomic
    /// update, moving the document to `processed`.
    async fn complete_extraction(
        &self,
        document_id: &str,
        result: CanonicalExtractionResult,
        flags: ValidationFlags,
    ) -> Result<()>;

    /// Terminal failure: status `failed` plus the error message.
    async fn fail_extraction(&self, document_id: &str, error: &str) -> Result<()>;

    /// Keep a failed attachment around for manual reprocessing instead of
    /// dropping it silently.
    async fn record_attachment_failure(
        &self,
        email_id: &str,
        filename: &str,
        error: &str,
    ) -> Result<()>;

    async fn mark_email_processed(&self, email_id: &str) -> Result<()>;
}

/// One document's record in the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct DocumentRecord {
    pub status: Option<DocumentStatus>,
    pub result: Option<CanonicalExtractionResult>,
    pub flags: Option<ValidationFlags>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttachmentFailure {
    pub email_id: String,
    pub filename: String,
    pub error: String,
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, DocumentRecord>,
    processed_emails: HashSet<String>,
    attachment_failures: Vec<AttachmentFailure>,
}

/// In-memory [`DocumentStore`]. Attachment bytes are spooled to disk so jobs
/// carry a resolvable file path.
pub struct MemoryStore {
    spool_dir: PathBuf,
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new(spool_dir: PathBuf) -> Self {
        Self {
            spool_dir,
            state: Arc::new(RwLock::new(MemoryState::default())),
        }
    }

    fn file_type_for(content_type: &str) -> Result<FileType> {
        match content_type {
            "application/pdf" => Ok(FileType::Pdf),
            t if t.starts_with("image/") => Ok(FileType::Image),
            other => anyhow::bail!("unsupported attachment content type: {other}"),
        }
    }

    pub async fn status_of(&self, document_id: &str) -> Option<DocumentStatus> {
        self.state
            .read()
            .await
            .documents
            .get(document_id)
            .and_then(|r| r.status)
    }

    pub async fn document(&self, document_id: &str) -> Option<DocumentRecord> {
        self.state.read().await.documents.get(document_id).cloned()
    }

    pub async fn document_ids(&self) -> Vec<String> {
        self.state.read().await.documents.keys().cloned().collect()
    }

    pub async fn email_processed(&self, email_id: &str) -> bool {
        self.state.read().await.processed_emails.contains(email_id)
    }

    pub async fn attachment_failures(&self) -> Vec<AttachmentFailure> {
        self.state.read().await.attachment_failures.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_from_attachment(
        &self,
        _user_id: &str,
        email_id: &str,
        attachment: &EmailAttachment,
    ) -> Result<StoredDocument> {
        let file_type = Self::file_type_for(&attachment.content_type)?;
        let bytes = BASE64
            .decode(&attachment.data)
            .context("attachment payload is not valid base64")?;

        let document_id = Uuid::new_v4().to_string();
        // Spool under the final path component only; attachment filenames are
        // sender-controlled and must not escape the spool directory.
        let file_name = Path::new(&attachment.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let file_path = self.spool_dir.join(format!("{document_id}-{file_name}"));
        tokio::fs::write(&file_path, &bytes)
            .await
            .with_context(|| format!("failed to spool attachment {}", attachment.filename))?;

        let mut state = self.state.write().await;
        state.documents.insert(
            document_id.clone(),
            DocumentRecord {
                status: Some(DocumentStatus::Uploaded),
                ..Default::default()
            },
        );

        tracing::debug!(
            document_id = %document_id,
            email_id,
            filename = %attachment.filename,
            "Materialized attachment as document"
        );

        Ok(StoredDocument {
            document_id,
            file_path,
            file_type,
            file_name: attachment.filename.clone(),
        })
    }

    async fn set_status(&self, document_id: &str, status: DocumentStatus) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .documents
            .entry(document_id.to_string())
            .or_default()
            .status = Some(status);
        Ok(())
    }

    async fn complete_extraction(
        &self,
        document_id: &str,
        result: CanonicalExtractionResult,
        flags: ValidationFlags,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state.documents.entry(document_id.to_string()).or_default();
        record.status = Some(DocumentStatus::Processed);
        record.result = Some(result);
        record.flags = Some(flags);
        record.error = None;
        Ok(())
    }

    async fn fail_extraction(&self, document_id: &str, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state.documents.entry(document_id.to_string()).or_default();
        record.status = Some(DocumentStatus::Failed);
        record.error = Some(error.to_string());
        Ok(())
    }

    async fn record_attachment_failure(
        &self,
        email_id: &str,
        filename: &str,
        error: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.attachment_failures.push(AttachmentFailure {
            email_id: email_id.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
        });
        Ok(())
    }

    async fn mark_email_processed(&self, email_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.processed_emails.insert(email_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(content_type: &str) -> EmailAttachment {
        EmailAttachment {
            filename: "invoice.pdf".to_string(),
            content_type: content_type.to_string(),
            size: 4,
            data: BASE64.encode(b"%PDF"),
        }
    }

    #[tokio::test]
    async fn materializes_attachment_to_spool() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().to_path_buf());

        let stored = store
            .create_from_attachment("u-1", "e-1", &attachment("application/pdf"))
            .await
            .unwrap();

        assert_eq!(stored.file_type, FileType::Pdf);
        assert_eq!(
            tokio::fs::read(&stored.file_path).await.unwrap(),
            b"%PDF".to_vec()
        );
        assert_eq!(
            store.status_of(&stored.document_id).await,
            Some(DocumentStatus::Uploaded)
        );
    }

    #[tokio::test]
    async fn spool_path_strips_directory_components() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().to_path_buf());

        let mut traversal = attachment("application/pdf");
        traversal.filename = "../outside/invoice.pdf".to_string();

        let stored = store
            .create_from_attachment("u-1", "e-1", &traversal)
            .await
            .unwrap();

        assert!(stored.file_path.starts_with(dir.path()));
        assert!(stored
            .file_path
            .to_string_lossy()
            .ends_with("invoice.pdf"));
        assert_eq!(
            tokio::fs::read(&stored.file_path).await.unwrap(),
            b"%PDF".to_vec()
        );
    }

    #[tokio::test]
    async fn rejects_unsupported_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().to_path_buf());

        let result = store
            .create_from_attachment("u-1", "e-1", &attachment("application/zip"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn completion_is_a_single_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().to_path_buf());

        let mut result = CanonicalExtractionResult::default();
        result.vendor_name = Some("Acme".to_string());
        let mut flags = ValidationFlags::default();
        flags.needs_human_review = true;

        store
            .complete_extraction("d-1", result, flags)
            .await
            .unwrap();

        let record = store.document("d-1").await.unwrap();
        assert_eq!(record.status, Some(DocumentStatus::Processed));
        assert_eq!(
            record.result.unwrap().vendor_name.as_deref(),
            Some("Acme")
        );
        assert!(record.flags.unwrap().needs_human_review);
    }

    #[tokio::test]
    async fn failure_keeps_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().to_path_buf());

        store.fail_extraction("d-2", "provider exhausted").await.unwrap();

        let record = store.document("d-2").await.unwrap();
        assert_eq!(record.status, Some(DocumentStatus::Failed));
        assert_eq!(record.error.as_deref(), Some("provider exhausted"));
    }
}
