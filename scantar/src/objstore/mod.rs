//! The object storage seam.
//!
//! The pipeline only ever talks to storage through [`ObjectStore`]: paginated listing, plain and
//! ranged GETs, and the three-call multipart upload protocol.  The production implementation is
//! [`S3Store`]; tests substitute an in-memory store behind the same trait.

use crate::Result;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;

mod s3;

pub use s3::S3Store;

/// One object surfaced by a listing page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// A page of listing results plus the token for the next page, if any.
#[derive(Debug, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    pub next: Option<String>,
}

/// An etag/part-number pair collected while uploading segment parts.
#[derive(Clone, Debug)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Object body as a stream of chunks; the caller drives it and accounts bytes as they arrive.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch one page of the bucket listing.  Entries with no usable key or size are filtered
    /// out by the implementation.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        continuation: Option<String>,
    ) -> Result<ListPage>;

    /// GET an object, optionally bounded to a byte range (`bytes=start-end` inclusive on the
    /// wire; `range` here is half-open).
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<BodyStream>;

    /// Begin a multipart upload, stamping the given user metadata onto the destination object.
    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String>;

    /// Upload one part, reading `length` bytes of the local file at `offset`.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        path: &Path,
        offset: u64,
        length: u64,
    ) -> Result<UploadedPart>;

    /// Stitch the uploaded parts into the final object.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()>;

    /// Discard an upload after a part failure so the store can reclaim the parts.
    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}
