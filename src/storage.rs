//! Capture persistence.
//!
//! `CaptureStore` is the only way a captured image leaves the pipeline. The
//! backend is picked once from `StorageMode`:
//! - Development: `LocalCaptureStore` writes JPEG files into `output_dir`.
//! - Production: `HttpUploadStore` PUTs to an object-store endpoint (feature: upload-http).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use thiserror::Error;

use crate::config::{StorageMode, StorageSettings};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write capture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("upload failed after {attempts} attempt(s): {reason}")]
    Upload { attempts: u32, reason: String },
    #[error("capture rejected: {0}")]
    Rejected(String),
}

/// What is known about a capture at the time it is stored.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureMetadata {
    pub track_id: u32,
    pub confidence: f32,
    pub timestamp: SystemTime,
}

impl CaptureMetadata {
    /// `person_id<track>_<YYYYmmdd_HHMMSS_micros>_<conf>.jpg`
    pub fn file_name(&self) -> String {
        let local: DateTime<Local> = self.timestamp.into();
        format!(
            "person_id{}_{}_{:.2}.jpg",
            self.track_id,
            local.format("%Y%m%d_%H%M%S_%6f"),
            self.confidence
        )
    }

    /// `<prefix>/<YYYY>/<MM>/<DD>/<file name>`, with an empty prefix omitted.
    pub fn object_key(&self, prefix: &str) -> String {
        let local: DateTime<Local> = self.timestamp.into();
        let day = local.format("%Y/%m/%d");
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", day, self.file_name())
        } else {
            format!("{}/{}/{}", prefix, day, self.file_name())
        }
    }
}

pub trait CaptureStore: Send {
    /// Persist a JPEG-encoded capture. Returns a URI or path for the stored image.
    fn store(&self, jpeg: &[u8], meta: &CaptureMetadata) -> Result<String, StoreError>;
}

impl<T: CaptureStore + Sync + ?Sized> CaptureStore for Arc<T> {
    fn store(&self, jpeg: &[u8], meta: &CaptureMetadata) -> Result<String, StoreError> {
        (**self).store(jpeg, meta)
    }
}

pub fn build_capture_store(settings: &StorageSettings) -> Result<Box<dyn CaptureStore>> {
    match settings.mode {
        StorageMode::Development => {
            log::info!(
                "captures will be saved under {}",
                settings.output_dir.display()
            );
            Ok(Box::new(LocalCaptureStore::new(&settings.output_dir)))
        }
        StorageMode::Production => build_upload_store(settings),
    }
}

#[cfg(feature = "upload-http")]
fn build_upload_store(settings: &StorageSettings) -> Result<Box<dyn CaptureStore>> {
    let upload = settings
        .upload
        .as_ref()
        .ok_or_else(|| anyhow!("production storage requires an upload endpoint"))?;
    let store = HttpUploadStore::new(
        &upload.endpoint,
        &upload.prefix,
        upload.max_attempts,
        upload.retry_delay,
    )?;
    log::info!("captures will be uploaded to {}", upload.endpoint);
    Ok(Box::new(store))
}

#[cfg(not(feature = "upload-http"))]
fn build_upload_store(_settings: &StorageSettings) -> Result<Box<dyn CaptureStore>> {
    Err(anyhow!(
        "production storage requires the upload-http feature"
    ))
}

// ----------------------------------------------------------------------------
// Local directory
// ----------------------------------------------------------------------------

pub struct LocalCaptureStore {
    dir: PathBuf,
}

impl LocalCaptureStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CaptureStore for LocalCaptureStore {
    fn store(&self, jpeg: &[u8], meta: &CaptureMetadata) -> Result<String, StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(meta.file_name());
        std::fs::write(&path, jpeg).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path.display().to_string())
    }
}

// ----------------------------------------------------------------------------
// HTTP object upload
// ----------------------------------------------------------------------------

#[cfg(feature = "upload-http")]
pub struct HttpUploadStore {
    endpoint: String,
    prefix: String,
    max_attempts: u32,
    retry_delay: std::time::Duration,
}

#[cfg(feature = "upload-http")]
impl HttpUploadStore {
    pub fn new(
        endpoint: &str,
        prefix: &str,
        max_attempts: u32,
        retry_delay: std::time::Duration,
    ) -> Result<Self> {
        url::Url::parse(endpoint).map_err(|e| anyhow!("invalid upload endpoint {}: {}", endpoint, e))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            prefix: prefix.to_string(),
            max_attempts: max_attempts.max(1),
            retry_delay,
        })
    }

    pub fn object_url(&self, meta: &CaptureMetadata) -> String {
        format!("{}/{}", self.endpoint, meta.object_key(&self.prefix))
    }
}

#[cfg(feature = "upload-http")]
impl CaptureStore for HttpUploadStore {
    fn store(&self, jpeg: &[u8], meta: &CaptureMetadata) -> Result<String, StoreError> {
        let url = self.object_url(meta);
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match ureq::put(&url)
                .set("Content-Type", "image/jpeg")
                .send_bytes(jpeg)
            {
                Ok(_) => return Ok(url),
                Err(e) => {
                    last_error = e.to_string();
                    log::warn!(
                        "upload of {} failed (attempt {}/{}): {}",
                        url,
                        attempt,
                        self.max_attempts,
                        last_error
                    );
                    if attempt < self.max_attempts {
                        std::thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        Err(StoreError::Upload {
            attempts: self.max_attempts,
            reason: last_error,
        })
    }
}

// ----------------------------------------------------------------------------
// In-memory store
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct StoredCapture {
    pub key: String,
    pub jpeg: Vec<u8>,
    pub meta: CaptureMetadata,
}

/// Keeps captures in memory. `fail_next(n)` makes the next `n` stores fail.
#[derive(Default)]
pub struct InMemoryCaptureStore {
    stored: Mutex<Vec<StoredCapture>>,
    failures_pending: Mutex<u32>,
}

impl InMemoryCaptureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        *lock(&self.failures_pending) = count;
    }

    pub fn stored(&self) -> Vec<StoredCapture> {
        lock(&self.stored).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.stored).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CaptureStore for InMemoryCaptureStore {
    fn store(&self, jpeg: &[u8], meta: &CaptureMetadata) -> Result<String, StoreError> {
        {
            let mut pending = lock(&self.failures_pending);
            if *pending > 0 {
                *pending -= 1;
                return Err(StoreError::Rejected("injected failure".to_string()));
            }
        }
        let key = format!("memory://{}", meta.file_name());
        lock(&self.stored).push(StoredCapture {
            key: key.clone(),
            jpeg: jpeg.to_vec(),
            meta: meta.clone(),
        });
        Ok(key)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta() -> CaptureMetadata {
        let local = Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("unambiguous local time");
        CaptureMetadata {
            track_id: 12,
            confidence: 0.876,
            timestamp: SystemTime::from(local),
        }
    }

    #[test]
    fn file_name_carries_track_time_and_confidence() {
        assert_eq!(
            meta().file_name(),
            "person_id12_20240309_140507_000000_0.88.jpg"
        );
    }

    #[test]
    fn object_key_is_partitioned_by_day() {
        let m = meta();
        assert_eq!(
            m.object_key("/captures/"),
            format!("captures/2024/03/09/{}", m.file_name())
        );
        assert_eq!(m.object_key(""), format!("2024/03/09/{}", m.file_name()));
    }

    #[test]
    fn local_store_writes_into_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalCaptureStore::new(dir.path().join("detected_persons"));
        let path = store.store(b"jpeg-bytes", &meta()).unwrap();

        assert!(path.ends_with(&meta().file_name()));
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg-bytes");
    }

    #[test]
    fn in_memory_store_injects_failures() {
        let store = InMemoryCaptureStore::new();
        store.fail_next(1);
        assert!(matches!(
            store.store(b"a", &meta()),
            Err(StoreError::Rejected(_))
        ));
        assert!(store.store(b"b", &meta()).is_ok());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn development_mode_builds_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StorageSettings {
            mode: StorageMode::Development,
            output_dir: dir.path().to_path_buf(),
            upload: None,
        };
        let store = build_capture_store(&settings).unwrap();
        assert!(store.store(b"x", &meta()).is_ok());
    }

    #[cfg(not(feature = "upload-http"))]
    #[test]
    fn production_mode_needs_upload_feature() {
        let settings = StorageSettings {
            mode: StorageMode::Production,
            ..StorageSettings::default()
        };
        assert!(build_capture_store(&settings).is_err());
    }
}
