//! Photo and signature capture, upload and compensation
//!
//! Capture is local: files get a `blob:` preview handle as soon as they are
//! selected and nothing touches storage until finalize. At finalize every file
//! is uploaded in order; if the database write that follows fails, the
//! uploaded objects are deleted again.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{EvidenceArtifact, EvidenceKind};
use crate::infra::{EvidenceStorage, LogisticsError, Result};
use crate::metrics::{metric_names, MetricsRegistry};

/// A photo or signature file as selected by the driver
#[derive(Clone, PartialEq, Eq)]
pub struct EvidenceFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl EvidenceFile {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    fn type_extension(&self) -> Option<&'static str> {
        match self.content_type.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some("jpg"),
            "image/png" => Some("png"),
            "image/webp" => Some("webp"),
            "image/heic" => Some("heic"),
            "application/pdf" => Some("pdf"),
            _ => None,
        }
    }

    /// Object extension, from the content type first and the file name second
    pub fn extension(&self) -> String {
        if let Some(ext) = self.type_extension() {
            return ext.to_string();
        }
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.len() <= 5)
            .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "bin".to_string())
    }

    /// Raster images and PDF only. A generic content type is judged by the
    /// file name; any other declared type is refused.
    pub fn is_accepted_type(&self) -> bool {
        if self.type_extension().is_some() {
            return true;
        }
        let content_type = self.content_type.trim().to_ascii_lowercase();
        let generic = content_type.is_empty() || content_type == "application/octet-stream";
        generic && ACCEPTED_NAME_EXTENSIONS.contains(&self.extension().as_str())
    }
}

const ACCEPTED_NAME_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "webp", "heic", "pdf"];

impl fmt::Debug for EvidenceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidenceFile")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

/// Local preview handle of a captured file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PreviewHandle(String);

impl PreviewHandle {
    fn mint() -> Self {
        Self(format!("blob:{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Files handed to a finalize or occurrence operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceBundle {
    pub photos: Vec<EvidenceFile>,
    pub signature: Option<EvidenceFile>,
}

impl EvidenceBundle {
    pub fn with_photo(mut self, photo: EvidenceFile) -> Self {
        self.photos.push(photo);
        self
    }

    pub fn with_signature(mut self, signature: EvidenceFile) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn has_photos(&self) -> bool {
        !self.photos.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty() && self.signature.is_none()
    }
}

/// Photos and signature captured on the device, not yet uploaded
#[derive(Debug, Default)]
pub struct EvidenceCapture {
    photos: Vec<(PreviewHandle, EvidenceFile)>,
    signature: Option<(PreviewHandle, EvidenceFile)>,
    live: HashSet<PreviewHandle>,
}

impl EvidenceCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_photo(&mut self, file: EvidenceFile) -> PreviewHandle {
        let handle = PreviewHandle::mint();
        self.live.insert(handle.clone());
        self.photos.push((handle.clone(), file));
        handle
    }

    /// Drop a photo and revoke its preview. Returns false for unknown handles.
    pub fn remove_photo(&mut self, handle: &PreviewHandle) -> bool {
        let before = self.photos.len();
        self.photos.retain(|(h, _)| h != handle);
        let removed = self.photos.len() != before;
        if removed {
            self.live.remove(handle);
        }
        removed
    }

    /// Set the signature, revoking the preview of the previous one
    pub fn set_signature(&mut self, file: EvidenceFile) -> PreviewHandle {
        if let Some((old, _)) = self.signature.take() {
            self.live.remove(&old);
        }
        let handle = PreviewHandle::mint();
        self.live.insert(handle.clone());
        self.signature = Some((handle.clone(), file));
        handle
    }

    pub fn clear_signature(&mut self) {
        if let Some((old, _)) = self.signature.take() {
            self.live.remove(&old);
        }
    }

    pub fn is_previewable(&self, handle: &PreviewHandle) -> bool {
        self.live.contains(handle)
    }

    pub fn photo_count(&self) -> usize {
        self.photos.len()
    }

    pub fn previews(&self) -> Vec<PreviewHandle> {
        self.photos.iter().map(|(h, _)| h.clone()).collect()
    }

    /// Hand the captured files over for upload; every preview is released
    pub fn into_bundle(self) -> EvidenceBundle {
        EvidenceBundle {
            photos: self.photos.into_iter().map(|(_, f)| f).collect(),
            signature: self.signature.map(|(_, f)| f),
        }
    }
}

/// Artifacts produced by uploading a bundle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadedEvidence {
    pub photos: Vec<EvidenceArtifact>,
    pub signature: Option<EvidenceArtifact>,
}

impl UploadedEvidence {
    pub fn all(&self) -> Vec<EvidenceArtifact> {
        self.photos
            .iter()
            .chain(self.signature.iter())
            .cloned()
            .collect()
    }

    pub fn signature_url(&self) -> Option<String> {
        self.signature.as_ref().map(|s| s.url.clone())
    }
}

/// Object key `{owner}/{unix_millis}-{random8}.{ext}`
pub fn object_key(owner: Uuid, file: &EvidenceFile) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!(
        "{owner}/{}-{suffix}.{}",
        Utc::now().timestamp_millis(),
        file.extension()
    )
}

/// Uploads evidence and undoes uploads whose database write failed
#[derive(Clone)]
pub struct EvidenceUploader {
    storage: Arc<dyn EvidenceStorage>,
    metrics: Arc<MetricsRegistry>,
}

impl EvidenceUploader {
    pub fn new(storage: Arc<dyn EvidenceStorage>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { storage, metrics }
    }

    async fn upload_one(
        &self,
        owner: Uuid,
        kind: EvidenceKind,
        file: &EvidenceFile,
    ) -> Result<EvidenceArtifact> {
        let key = object_key(owner, file);
        let start = Instant::now();
        let url = self
            .storage
            .put(&key, file.bytes.clone(), &file.content_type)
            .await?;
        self.metrics
            .observe_histogram(metric_names::UPLOAD_LATENCY, start.elapsed().as_secs_f64())
            .await;
        self.metrics
            .inc_counter(metric_names::EVIDENCE_UPLOADED)
            .await;
        Ok(EvidenceArtifact {
            kind,
            key,
            url,
            captured_at: Utc::now(),
        })
    }

    /// Upload photos then signature, one at a time. If any upload fails the
    /// ones already stored are deleted before the error is returned.
    pub async fn upload(&self, owner: Uuid, bundle: &EvidenceBundle) -> Result<UploadedEvidence> {
        if let Some(file) = bundle
            .photos
            .iter()
            .chain(bundle.signature.iter())
            .find(|f| !f.is_accepted_type())
        {
            return Err(LogisticsError::InvalidInput(format!(
                "{} has unsupported content type {}",
                file.file_name, file.content_type
            )));
        }

        let mut uploaded = UploadedEvidence::default();

        for photo in &bundle.photos {
            match self.upload_one(owner, EvidenceKind::Photo, photo).await {
                Ok(artifact) => uploaded.photos.push(artifact),
                Err(e) => {
                    warn!(%owner, error = %e, "Evidence upload failed");
                    self.compensate(&uploaded.all()).await;
                    return Err(e);
                }
            }
        }

        if let Some(signature) = &bundle.signature {
            match self
                .upload_one(owner, EvidenceKind::Signature, signature)
                .await
            {
                Ok(artifact) => uploaded.signature = Some(artifact),
                Err(e) => {
                    warn!(%owner, error = %e, "Signature upload failed");
                    self.compensate(&uploaded.all()).await;
                    return Err(e);
                }
            }
        }

        Ok(uploaded)
    }

    /// Delete uploaded objects. Returns how many could not be deleted; those
    /// are logged with their keys for manual reconciliation.
    pub async fn compensate(&self, artifacts: &[EvidenceArtifact]) -> usize {
        let mut orphaned = 0;
        for artifact in artifacts {
            match self.storage.delete(&artifact.key).await {
                Ok(()) => {
                    self.metrics
                        .inc_counter(metric_names::EVIDENCE_COMPENSATED)
                        .await;
                }
                Err(e) => {
                    orphaned += 1;
                    self.metrics
                        .inc_counter(metric_names::EVIDENCE_ORPHANED)
                        .await;
                    error!(key = %artifact.key, url = %artifact.url, error = %e, "Orphaned evidence object");
                }
            }
        }
        if !artifacts.is_empty() {
            info!(
                deleted = artifacts.len() - orphaned,
                orphaned, "Compensated evidence uploads"
            );
        }
        orphaned
    }

    /// Run the database write; on failure delete the uploads it would have
    /// referenced and return the write's error.
    pub async fn commit_or_compensate<T, F>(&self, uploaded: &UploadedEvidence, write: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match write.await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.compensate(&uploaded.all()).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InMemoryObjectStorage;

    fn jpeg(name: &str) -> EvidenceFile {
        EvidenceFile::new(name, "image/jpeg", vec![0xff, 0xd8])
    }

    fn uploader(storage: Arc<InMemoryObjectStorage>) -> (EvidenceUploader, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        (EvidenceUploader::new(storage, metrics.clone()), metrics)
    }

    #[test]
    fn test_extension_resolution() {
        assert_eq!(jpeg("x").extension(), "jpg");
        assert_eq!(
            EvidenceFile::new("sig.PNG", "application/octet-stream", vec![]).extension(),
            "png"
        );
        assert_eq!(
            EvidenceFile::new("noext", "application/octet-stream", vec![]).extension(),
            "bin"
        );
    }

    #[test]
    fn test_svg_and_unknown_types_refused() {
        assert!(jpeg("a.jpg").is_accepted_type());
        assert!(EvidenceFile::new("a.JPEG", "application/octet-stream", vec![]).is_accepted_type());
        assert!(!EvidenceFile::new("a.svg", "image/svg+xml", vec![]).is_accepted_type());
        assert!(!EvidenceFile::new("a.jpg", "image/svg+xml", vec![]).is_accepted_type());
        assert!(!EvidenceFile::new("a.svg", "application/octet-stream", vec![]).is_accepted_type());
        assert!(!EvidenceFile::new("a.html", "text/html", vec![]).is_accepted_type());
        assert_eq!(
            EvidenceFile::new("a.svg", "image/svg+xml", vec![]).extension(),
            "svg"
        );
    }

    #[tokio::test]
    async fn test_svg_signature_rejected_before_any_upload() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        let (uploader, metrics) = uploader(storage.clone());
        let bundle = EvidenceBundle::default()
            .with_photo(jpeg("1.jpg"))
            .with_signature(EvidenceFile::new(
                "sig.svg",
                "image/svg+xml",
                b"<svg/>".to_vec(),
            ));

        let result = uploader.upload(Uuid::new_v4(), &bundle).await;
        assert!(matches!(result, Err(LogisticsError::InvalidInput(_))));
        assert!(storage.is_empty().await);
        assert_eq!(metrics.get_counter(metric_names::EVIDENCE_UPLOADED).await, 0);
    }

    #[test]
    fn test_object_key_shape() {
        let owner = Uuid::new_v4();
        let key = object_key(owner, &jpeg("a.jpg"));
        let (prefix, name) = key.split_once('/').unwrap();
        assert_eq!(prefix, owner.to_string());
        let (stamp, rest) = name.split_once('-').unwrap();
        assert!(stamp.parse::<i64>().is_ok());
        assert_eq!(rest.len(), "abcdefgh.jpg".len());
        assert!(rest.ends_with(".jpg"));
        assert_ne!(key, object_key(owner, &jpeg("a.jpg")));
    }

    #[test]
    fn test_capture_preview_lifecycle() {
        let mut capture = EvidenceCapture::new();
        let first = capture.add_photo(jpeg("1.jpg"));
        let second = capture.add_photo(jpeg("2.jpg"));
        assert!(first.as_str().starts_with("blob:"));
        assert!(capture.is_previewable(&first));

        assert!(capture.remove_photo(&first));
        assert!(!capture.is_previewable(&first));
        assert!(!capture.remove_photo(&first));
        assert_eq!(capture.previews(), vec![second]);

        let sig = capture.set_signature(jpeg("sig.jpg"));
        let replaced = capture.set_signature(jpeg("sig2.jpg"));
        assert!(!capture.is_previewable(&sig));
        assert!(capture.is_previewable(&replaced));

        let bundle = capture.into_bundle();
        assert_eq!(bundle.photos.len(), 1);
        assert_eq!(bundle.signature.unwrap().file_name, "sig2.jpg");
    }

    #[tokio::test]
    async fn test_upload_bundle() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        let (uploader, metrics) = uploader(storage.clone());
        let owner = Uuid::new_v4();
        let bundle = EvidenceBundle::default()
            .with_photo(jpeg("1.jpg"))
            .with_photo(jpeg("2.jpg"))
            .with_signature(EvidenceFile::new("s.png", "image/png", vec![1]));

        let uploaded = uploader.upload(owner, &bundle).await.unwrap();
        assert_eq!(uploaded.photos.len(), 2);
        assert!(uploaded.signature_url().unwrap().ends_with(".png"));
        assert_eq!(storage.len().await, 3);
        assert_eq!(metrics.get_counter(metric_names::EVIDENCE_UPLOADED).await, 3);
    }

    #[tokio::test]
    async fn test_failed_upload_removes_earlier_objects() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        storage.fail_puts_after(1);
        let (uploader, _) = uploader(storage.clone());
        let bundle = EvidenceBundle::default()
            .with_photo(jpeg("1.jpg"))
            .with_photo(jpeg("2.jpg"));

        let result = uploader.upload(Uuid::new_v4(), &bundle).await;
        assert!(matches!(result, Err(LogisticsError::UploadFailure(_))));
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_write_compensates_and_counts_orphans() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        let (uploader, metrics) = uploader(storage.clone());
        let bundle = EvidenceBundle::default().with_photo(jpeg("1.jpg"));
        let uploaded = uploader.upload(Uuid::new_v4(), &bundle).await.unwrap();

        storage.fail_deletes(true);
        let result: Result<()> = uploader
            .commit_or_compensate(&uploaded, async {
                Err(LogisticsError::Persistence("down".to_string()))
            })
            .await;
        assert!(matches!(result, Err(LogisticsError::Persistence(_))));
        assert_eq!(metrics.get_counter(metric_names::EVIDENCE_ORPHANED).await, 1);
        assert_eq!(storage.len().await, 1);
    }
}
