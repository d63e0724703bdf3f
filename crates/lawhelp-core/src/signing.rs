//! Signing workflow: upload the signature image, render and upload the
//! signed PDF, then record both on the document row in one write.
//!
//! Objects uploaded by a failed attempt are deleted again, so a document
//! row never points at an object that a failed request left behind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    db::Db,
    pdf::{self, SignedPdf},
    storage::{self, ObjectStore},
    types::Document,
};

const TRACING_TARGET: &str = "lawhelp_core::signing";

/// Everything persisted on a document once it is signed.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureRecord {
    pub signer_name: String,
    pub signature_url: String,
    pub signature_hash: String,
    pub signed_pdf_url: String,
}

/// Where signature records are written.
#[async_trait]
pub trait SignatureLedger: Send + Sync {
    async fn record_signature(&self, doc_id: i64, record: &SignatureRecord) -> Result<()>;
}

#[async_trait]
impl SignatureLedger for Db {
    async fn record_signature(&self, doc_id: i64, record: &SignatureRecord) -> Result<()> {
        self.set_signature(doc_id, record).await
    }
}

pub struct SignRequest<'a> {
    pub document: &'a Document,
    pub signer_name: &'a str,
    pub image: &'a [u8],
    pub filename: &'a str,
    pub content_type: &'a str,
    /// Hex SHA-256 of `image`.
    pub signature_hash: &'a str,
    pub signed_at: DateTime<Utc>,
}

pub async fn sign_document(
    store: &dyn ObjectStore,
    ledger: &dyn SignatureLedger,
    request: SignRequest<'_>,
) -> Result<SignatureRecord> {
    let doc_id = request.document.id;
    let signature_path =
        storage::signature_path(doc_id, request.signed_at.timestamp(), request.filename);
    let signature_url = store
        .put(&signature_path, request.image.to_vec(), request.content_type)
        .await
        .context("failed to upload signature image")?;

    let signed_at = request.signed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let rendered = pdf::render_signed_pdf(&SignedPdf {
        title: &request.document.title,
        content: &request.document.content,
        signer_name: request.signer_name,
        signature_image: request.image,
        signature_hash: request.signature_hash,
        signed_at: &signed_at,
    });
    let pdf_bytes = match rendered {
        Ok(bytes) => bytes,
        Err(e) => {
            discard(store, &[signature_path.as_str()]).await;
            return Err(e.context("failed to render signed PDF"));
        }
    };

    let pdf_path = storage::signed_pdf_path(doc_id);
    let signed_pdf_url = match store.put(&pdf_path, pdf_bytes, "application/pdf").await {
        Ok(url) => url,
        Err(e) => {
            discard(store, &[signature_path.as_str()]).await;
            return Err(e.context("failed to upload signed PDF"));
        }
    };

    let record = SignatureRecord {
        signer_name: request.signer_name.to_string(),
        signature_url,
        signature_hash: request.signature_hash.to_string(),
        signed_pdf_url,
    };
    if let Err(e) = ledger.record_signature(doc_id, &record).await {
        discard(store, &[signature_path.as_str(), pdf_path.as_str()]).await;
        return Err(e.context("failed to record signature"));
    }

    info!(target: TRACING_TARGET, doc_id, store = store.name(), "signature recorded");
    Ok(record)
}

/// Best-effort removal of objects from an abandoned attempt.
async fn discard(store: &dyn ObjectStore, paths: &[&str]) {
    for path in paths {
        if let Err(e) = store.delete(path).await {
            warn!(target: TRACING_TARGET, path, "failed to delete orphaned object: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory bucket; `fail_put` names a path prefix whose uploads fail.
    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        deleted: Mutex<Vec<String>>,
        fail_put: Option<&'static str>,
    }

    impl MemoryStore {
        fn failing(prefix: &'static str) -> Self {
            Self {
                fail_put: Some(prefix),
                ..Self::default()
            }
        }

        fn paths(&self) -> Vec<String> {
            let mut paths: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
            paths.sort();
            paths
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
            if self.fail_put.is_some_and(|p| path.starts_with(p)) {
                bail!("bucket rejected {path}");
            }
            self.objects.lock().unwrap().insert(path.to_string(), bytes);
            Ok(format!("mem://{path}"))
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.objects.lock().unwrap().remove(path);
            self.deleted.lock().unwrap().push(path.to_string());
            Ok(())
        }

        fn name(&self) -> &str {
            "memory"
        }
    }

    #[derive(Default)]
    struct MemoryLedger {
        records: Mutex<Vec<(i64, SignatureRecord)>>,
        fail: bool,
    }

    #[async_trait]
    impl SignatureLedger for MemoryLedger {
        async fn record_signature(&self, doc_id: i64, record: &SignatureRecord) -> Result<()> {
            if self.fail {
                bail!("database is down");
            }
            self.records.lock().unwrap().push((doc_id, record.clone()));
            Ok(())
        }
    }

    fn document() -> Document {
        Document {
            id: 7,
            title: "Lease Agreement".into(),
            content: "The tenant shall pay rent monthly.".into(),
            user_id: None,
            created_at: Utc::now(),
            signer_name: None,
            signature_url: None,
            signature_hash: None,
            signed_pdf_url: None,
        }
    }

    fn request(doc: &Document) -> SignRequest<'_> {
        SignRequest {
            document: doc,
            signer_name: "Omar Farooq",
            image: b"not an image",
            filename: "my sig.png",
            content_type: "image/png",
            signature_hash: "deadbeef",
            signed_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn signing_uploads_both_objects_and_records_once() {
        let store = MemoryStore::default();
        let ledger = MemoryLedger::default();
        let doc = document();

        let record = sign_document(&store, &ledger, request(&doc)).await.unwrap();

        assert_eq!(
            store.paths(),
            vec!["signatures/7_1700000000_my_sig.png", "signed_pdfs/7_signed.pdf"]
        );
        assert_eq!(record.signature_url, "mem://signatures/7_1700000000_my_sig.png");
        assert_eq!(record.signed_pdf_url, "mem://signed_pdfs/7_signed.pdf");
        assert_eq!(*ledger.records.lock().unwrap(), vec![(7, record.clone())]);
        assert!(store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_pdf_upload_removes_signature_object() {
        let store = MemoryStore::failing("signed_pdfs/");
        let ledger = MemoryLedger::default();
        let doc = document();

        let err = sign_document(&store, &ledger, request(&doc)).await.unwrap_err();

        assert!(format!("{err:#}").contains("failed to upload signed PDF"));
        assert!(store.paths().is_empty());
        assert_eq!(
            *store.deleted.lock().unwrap(),
            vec!["signatures/7_1700000000_my_sig.png".to_string()]
        );
        assert!(ledger.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_record_removes_both_objects() {
        let store = MemoryStore::default();
        let ledger = MemoryLedger {
            fail: true,
            ..MemoryLedger::default()
        };
        let doc = document();

        let err = sign_document(&store, &ledger, request(&doc)).await.unwrap_err();

        assert!(format!("{err:#}").contains("database is down"));
        assert!(store.paths().is_empty());
        assert_eq!(store.deleted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_signature_upload_leaves_nothing_to_clean() {
        let store = MemoryStore::failing("signatures/");
        let ledger = MemoryLedger::default();
        let doc = document();

        assert!(sign_document(&store, &ledger, request(&doc)).await.is_err());
        assert!(store.deleted.lock().unwrap().is_empty());
        assert!(ledger.records.lock().unwrap().is_empty());
    }
}
