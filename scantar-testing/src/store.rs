//! An in-memory [`ObjectStore`] for hermetic pipeline tests.
//!
//! Behaves like a small S3: paginated listing with prefix/delimiter semantics, ranged GETs that
//! yield chunked bodies, and the full multipart upload protocol.  Failure injection knobs let
//! tests exercise the pipeline's per-object error handling and the uploader's abort path.

use bytes::Bytes;
use scantar::{
    BodyStream, ListPage, ObjectEntry, ObjectStore, Result, ScanTarError, UploadedPart,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Body chunk size; small enough that multi-chunk reads are exercised by modest objects.
const CHUNK_SIZE: usize = 1024;

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Bytes>,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<HashMap<String, BTreeMap<String, Bytes>>>,
    /// User metadata captured when a multipart upload completes, by `(bucket, key)`.
    metadata: Mutex<HashMap<(String, String), HashMap<String, String>>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_upload_id: AtomicU64,
    aborted_uploads: AtomicU64,

    /// Listing page size; tiny by default so pagination is always exercised.
    page_size: usize,

    /// Keys whose GET fails outright (`None`) or midway after N body bytes (`Some(n)`).
    failing_gets: Mutex<HashMap<String, Option<usize>>>,
    /// Destination keys whose part uploads fail.
    failing_parts: Mutex<HashSet<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            page_size: 3,
            ..Self::default()
        }
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .lock()
            .unwrap()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn object_metadata(&self, bucket: &str, key: &str) -> Option<HashMap<String, String>> {
        self.metadata
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Make every GET of `key` fail before the first byte.
    pub fn fail_get(&self, key: &str) {
        self.failing_gets
            .lock()
            .unwrap()
            .insert(key.to_string(), None);
    }

    /// Make every GET of `key` fail after yielding `after_bytes` of body.
    pub fn fail_get_after(&self, key: &str, after_bytes: usize) {
        self.failing_gets
            .lock()
            .unwrap()
            .insert(key.to_string(), Some(after_bytes));
    }

    /// Make part uploads targeting destination `key` fail.
    pub fn fail_parts_for(&self, key: &str) {
        self.failing_parts.lock().unwrap().insert(key.to_string());
    }

    pub fn pending_upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn aborted_upload_count(&self) -> u64 {
        self.aborted_uploads.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let buckets = self.buckets.lock().unwrap();
        let objects = buckets.get(bucket);

        let prefix = prefix.unwrap_or("");
        let mut entries = Vec::new();
        let mut next = None;

        if let Some(objects) = objects {
            for (key, data) in objects.iter() {
                if !key.starts_with(prefix) {
                    continue;
                }
                // Delimiter semantics: keys nested past the delimiter roll up into common
                // prefixes and are not listed
                if let Some(delimiter) = delimiter {
                    if key[prefix.len()..].contains(delimiter) {
                        continue;
                    }
                }
                if let Some(continuation) = &continuation {
                    if key <= continuation {
                        continue;
                    }
                }

                if entries.len() == self.page_size {
                    next = entries
                        .last()
                        .map(|entry: &ObjectEntry| entry.key.clone());
                    break;
                }

                entries.push(ObjectEntry {
                    key: key.clone(),
                    size: data.len() as u64,
                });
            }
        }

        Ok(ListPage { entries, next })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<BodyStream> {
        let failure = self.failing_gets.lock().unwrap().get(key).copied();
        if let Some(None) = failure {
            return Err(ScanTarError::StoreFailure {
                message: format!("injected GET failure for '{key}'"),
            });
        }

        let data = self
            .object(bucket, key)
            .ok_or_else(|| ScanTarError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let data = match range {
            Some(range) => data.slice(range.start as usize..(range.end as usize).min(data.len())),
            None => data,
        };

        let mut chunks: Vec<Result<Bytes>> = Vec::new();
        let mut emitted = 0usize;
        let fail_after = failure.flatten();

        let mut offset = 0usize;
        while offset < data.len() {
            let mut end = (offset + CHUNK_SIZE).min(data.len());

            if let Some(fail_after) = fail_after {
                if emitted + (end - offset) >= fail_after {
                    end = offset + (fail_after - emitted).min(end - offset);
                    if end > offset {
                        chunks.push(Ok(data.slice(offset..end)));
                    }
                    chunks.push(Err(ScanTarError::StoreFailure {
                        message: format!("injected body failure for '{key}'"),
                    }));
                    return Ok(Box::pin(futures::stream::iter(chunks)));
                }
            }

            chunks.push(Ok(data.slice(offset..end)));
            emitted += end - offset;
            offset = end;
        }

        if let Some(fail_after) = fail_after {
            if emitted <= fail_after {
                chunks.push(Err(ScanTarError::StoreFailure {
                    message: format!("injected body failure for '{key}'"),
                }));
            }
        }

        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        let id = format!(
            "upload-{}",
            self.next_upload_id.fetch_add(1, Ordering::Relaxed)
        );

        self.uploads.lock().unwrap().insert(
            id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
                metadata: metadata.clone(),
            },
        );

        Ok(id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        path: &Path,
        offset: u64,
        length: u64,
    ) -> Result<UploadedPart> {
        if self.failing_parts.lock().unwrap().contains(key) {
            return Err(ScanTarError::StoreFailure {
                message: format!("injected part failure for '{key}'"),
            });
        }

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ScanTarError::StoreFailure {
                message: format!("could not open '{}': {e}", path.display()),
            })?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| ScanTarError::StoreFailure {
                message: format!("seek failed: {e}"),
            })?;
        let mut section = vec![0u8; length as usize];
        file.read_exact(&mut section)
            .await
            .map_err(|e| ScanTarError::StoreFailure {
                message: format!("section read failed: {e}"),
            })?;

        let mut uploads = self.uploads.lock().unwrap();
        let pending =
            uploads
                .get_mut(upload_id)
                .ok_or_else(|| ScanTarError::UnknownUpload {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                })?;
        pending.parts.insert(part_number, Bytes::from(section));

        Ok(UploadedPart {
            part_number,
            etag: format!("etag-{upload_id}-{part_number}"),
        })
    }

    async fn complete_multipart(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let pending = self.uploads.lock().unwrap().remove(upload_id).ok_or_else(|| {
            ScanTarError::UnknownUpload {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            }
        })?;

        let mut assembled = Vec::new();
        for part in &parts {
            let data = pending.parts.get(&part.part_number).ok_or_else(|| {
                ScanTarError::StoreFailure {
                    message: format!("part {} was never uploaded", part.part_number),
                }
            })?;
            assembled.extend_from_slice(data);
        }

        self.buckets
            .lock()
            .unwrap()
            .entry(pending.bucket.clone())
            .or_default()
            .insert(pending.key.clone(), Bytes::from(assembled));
        self.metadata
            .lock()
            .unwrap()
            .insert((pending.bucket, pending.key), pending.metadata);

        Ok(())
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads.lock().unwrap().remove(upload_id);
        self.aborted_uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
