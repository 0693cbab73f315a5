//! The malware scanning seam.
//!
//! The pipeline treats the scanner as a library behind [`ScanEngine`]: one entry point for
//! in-memory buffers, one for on-disk paths, and a metadata map describing the engine that is
//! later stamped onto every uploaded segment.  The bundled implementation is a signature-database
//! matcher ([`SignatureDb`]); anything with the same shape (e.g. a libclamav binding) can be
//! swapped in behind the trait.

use crate::ready::{ready_pair, Ready};
use crate::units::GIB;
use crate::{error, Config, Result};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

mod sigdb;

pub use sigdb::SignatureDb;

/// Limits applied to every scan, configured once at engine initialization.
#[derive(Clone, Copy, Debug)]
pub struct ScanLimits {
    /// Total bytes the engine will look at in one scan.
    pub max_scan_size: u64,
    /// Wall-clock budget for one scan.
    pub max_scan_time: Duration,
    /// Files larger than this are rejected outright.
    pub max_file_size: u64,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_scan_size: 40 * GIB,
            max_scan_time: Duration::from_secs(90),
            max_file_size: 2 * GIB - 1,
        }
    }
}

/// Tri-state result of scanning one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Nothing matched; the object proceeds to the archiver.
    Clean,
    /// A signature matched; the object is dropped and reported.
    Infected { virus: String },
    /// The scan itself failed (timeout, I/O, over limit); the object is dropped and reported.
    Failed { message: String },
}

/// Description of the engine and its database, stamped as user metadata on every uploaded
/// segment: `vendor`, `version`, `signature_date` (RFC3339) and `result` (`pass`).
#[derive(Clone, Debug)]
pub struct ScanMetadata {
    pub vendor: String,
    pub version: String,
    pub signature_date: String,
}

impl ScanMetadata {
    pub(crate) fn as_upload_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("vendor".to_string(), self.vendor.clone()),
            ("version".to_string(), self.version.clone()),
            ("signature_date".to_string(), self.signature_date.clone()),
            ("result".to_string(), "pass".to_string()),
        ])
    }
}

pub trait ScanEngine: Send + Sync + 'static {
    /// Scan an in-memory object.
    fn scan_buffer(&self, data: &[u8], name: &str) -> ScanOutcome;

    /// Scan an object that was spilled to the local filesystem.
    fn scan_path(&self, path: &Path, name: &str) -> ScanOutcome;

    /// Engine description for upload metadata.
    fn metadata(&self) -> &ScanMetadata;
}

/// Kick off signature database loading and engine compilation in the background.
///
/// Scan workers await the returned [`Ready`]; if initialization fails the waiters observe the
/// dropped setter and the pipeline terminates.  The definitions directory is validated before
/// this is called, so failures here are database parse errors.
pub(crate) fn spawn_init(config: &Config) -> Ready<Arc<dyn ScanEngine>> {
    let (setter, ready) = ready_pair();
    let definitions = config.definitions.clone();

    tokio::task::spawn_blocking(move || {
        match SignatureDb::load(&definitions, ScanLimits::default()) {
            Ok(engine) => setter.set(Arc::new(engine) as Arc<dyn ScanEngine>),
            Err(e) => {
                // Dropping the setter wakes the scanner workers with an init failure
                error!(error = %e, "scan engine initialization failed");
            }
        }
    });

    ready
}

/// Validate that the definitions directory exists and is readable, without waiting for the full
/// database load.
pub(crate) fn check_definitions_path(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).context(error::DefinitionsPathSnafu { path })?;
    ensure!(
        meta.is_dir(),
        error::DefinitionsNotADirectorySnafu { path }
    );
    std::fs::read_dir(path).context(error::DefinitionsPathSnafu { path })?;

    Ok(())
}
