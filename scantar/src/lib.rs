//! Archive an object store bucket into rolling, size-capped `.tgz` segments, scanning every
//! object for malware on the way through, and upload the segments to a destination bucket.
//!
//! The crate is organized as a four-stage streaming pipeline with bounded queues between the
//! stages:
//!
//! 1. **Reader** — streams a local `metadata.jsonl` index of the source bucket, skipping keys
//!    already recorded in `upload.log` from earlier runs.
//! 2. **Downloader** — a worker pool that fetches each object, into a pooled memory buffer for
//!    small objects or a temp file filled by parallel ranged GETs for large ones.
//! 3. **Scanner** — a worker pool that runs every object through the [`ScanEngine`] and drops
//!    anything infected, reporting it on the error bus.
//! 4. **Archiver + Uploader** — a single tar+gzip writer packs clean objects into rolling
//!    segments capped by uncompressed size; finished segments go up with parallel multipart
//!    uploads, and their manifests are appended to `upload.log` for crash-safe resume.
//!
//! Per-object failures never stop the run; they are collected in `error.log`.  See
//! [`Pipeline`] for the entry point.

mod archiver;
mod config;
mod credentials;
mod download;
mod error;
mod events;
mod index;
mod metrics;
mod objstore;
mod pipeline;
mod pool;
mod reader;
mod ready;
mod scan;
mod scanner;
mod units;
mod upload;

pub use config::{Config, MIN_SIZE_CAP};
pub use error::{Result, ScanTarError};
pub use events::ErrorEvent;
pub use index::IndexSummary;
pub use metrics::{Metrics, MetricsSnapshot};
pub use objstore::{
    BodyStream, ListPage, ObjectEntry, ObjectStore, S3Store, UploadedPart,
};
pub use pipeline::Pipeline;
pub use scan::{ScanEngine, ScanLimits, ScanMetadata, ScanOutcome, SignatureDb};
pub use units::{humanize_bytes, humanize_rate, parse_byte_size, parse_duration};
