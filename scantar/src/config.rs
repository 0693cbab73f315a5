//! Pipeline configuration.
//!
//! The CLI populates this from environment variables; library users fill it directly.  Everything
//! has a default except the two bucket names.

use crate::units::{GIB, KIB, MIB};
use crate::{error, Result};
use snafu::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Minimum allowed uncompressed size cap per segment.
pub const MIN_SIZE_CAP: u64 = 100;

/// Objects larger than this are downloaded in parallel ranged parts.
pub(crate) const MULTIPART_DOWNLOAD_THRESHOLD: u64 = 8 * MIB;

/// Ranged parts per large-object download.
pub(crate) const DOWNLOAD_PART_COUNT: u64 = 8;

/// Byte ranges per segment multipart upload.
pub(crate) const UPLOAD_PART_COUNT: u64 = 8;

#[derive(Clone, Debug)]
pub struct Config {
    /// Bucket to archive.
    pub src_bucket: String,

    /// Bucket receiving the finished segments.
    pub dst_bucket: String,

    /// Uncompressed payload cap per segment.  A segment closes before packing the first object
    /// that would push it strictly past this; a single object larger than the cap still gets a
    /// segment of its own.
    pub size_cap: u64,

    /// Segment name template with one `%Nd` integer slot, e.g. `archive_%07d.tgz`.
    pub archive_name: String,

    /// Directory holding the malware signature database.
    pub definitions: PathBuf,

    /// Bypass the scanner stage entirely, wiring downloads straight into the archiver.
    pub disable_scanner: bool,

    /// Scanner worker pool size.
    pub scan_concurrency: usize,

    /// Download worker pool size.
    pub download_concurrency: usize,

    /// Upload worker pool size.
    pub upload_concurrency: usize,

    /// Objects at or below this size are held in pooled memory; anything larger spills to a temp
    /// file.
    pub max_in_mem: u64,

    /// How often the credential provider re-materializes the signing identity.
    pub refresh_interval: Duration,

    /// Restrict the listing to keys under this prefix.
    pub prefix_filter: Option<String>,

    /// Use `/` as the listing delimiter (flat listing).
    pub prefix_delimiter: bool,

    /// Optional `START:STRIDE[:END]` selector over metadata lines, parsed by
    /// [`crate::reader::Subset`].
    pub subset: Option<String>,

    /// Queue depth between the reader and the download pool.
    pub chan_to_download: usize,

    /// Queue depth between the download pool and the scanner pool.
    pub chan_downloaded: usize,

    /// Queue depth between the scanner pool and the archiver.
    pub chan_scanned: usize,

    /// Queue depth between the archiver and the upload pool.
    pub chan_archive: usize,

    /// Directory holding `metadata.jsonl`, `upload.log`, `error.log` and in-flight segments.
    pub work_dir: PathBuf,

    /// Use a custom S3 endpoint instead of AWS, for S3-compatible services.
    pub s3_endpoint: Option<Url>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            src_bucket: String::new(),
            dst_bucket: String::new(),
            size_cap: 2 * GIB,
            archive_name: "archive_%07d.tgz".to_string(),
            definitions: PathBuf::from("./db"),
            disable_scanner: false,
            scan_concurrency: 3,
            download_concurrency: 16,
            upload_concurrency: 2,
            max_in_mem: 96 * KIB,
            refresh_interval: Duration::from_secs(20 * 60),
            prefix_filter: None,
            prefix_delimiter: false,
            subset: None,
            chan_to_download: 10,
            chan_downloaded: 20,
            chan_scanned: 10,
            chan_archive: 2,
            work_dir: PathBuf::from("."),
            s3_endpoint: None,
        }
    }
}

impl Config {
    /// Check the parts of the config that would otherwise fail deep inside the run.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.src_bucket.is_empty() && !self.dst_bucket.is_empty(),
            error::MissingBucketConfigSnafu
        );
        ensure!(
            self.size_cap >= MIN_SIZE_CAP,
            error::SizeCapTooSmallSnafu {
                given: self.size_cap,
                minimum: MIN_SIZE_CAP,
            }
        );

        // Fail early on a bad template rather than when the first segment opens
        crate::archiver::SegmentTemplate::parse(&self.archive_name)?;

        if let Some(subset) = &self.subset {
            crate::reader::Subset::parse(subset)?;
        }

        Ok(())
    }

    pub(crate) fn metadata_path(&self) -> PathBuf {
        self.work_dir.join("metadata.jsonl")
    }

    pub(crate) fn upload_log_path(&self) -> PathBuf {
        self.work_dir.join("upload.log")
    }

    pub(crate) fn error_log_path(&self) -> PathBuf {
        self.work_dir.join("error.log")
    }
}
