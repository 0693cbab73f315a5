//! Pipeline wiring.
//!
//! A [`Pipeline`] owns everything the stages share — config, counters, buffer pools, the object
//! store handle and the scan engine gate — and wires the stages together with bounded channels:
//!
//! ```text
//! metadata.jsonl ─► reader ─► downloader pool ─► scanner pool ─► archiver ─► uploader pool
//!                                  │                  │              (single)      │
//!                                  └──────────── error bus ─────────────► error.log
//! ```
//!
//! Every queue is bounded, so a slow stage backpressures its producers instead of buffering the
//! bucket in memory.  Stages close their output when their input drains, and that cascade ends
//! with the uploader; aborting cancels a shared token that every stage watches.

use crate::download::{DownloadTask, WorkFile};
use crate::metrics::Metrics;
use crate::objstore::ObjectStore;
use crate::pool::BufferPool;
use crate::ready::{ready_pair, Ready};
use crate::scan::{self, ScanEngine};
use crate::{archiver, download, error, events, index, reader, scanner, upload};
use crate::{Config, Result};
use snafu::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Pipeline {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    store: Arc<dyn ObjectStore>,
    pool: Arc<BufferPool>,
    /// `None` when the scanner stage is disabled and downloads wire straight to the archiver.
    scan_engine: Option<Ready<Arc<dyn ScanEngine>>>,
}

impl Pipeline {
    /// Validate the config and start background initialization of the scan engine.
    ///
    /// The signature database loads concurrently with metadata indexing; scan workers gate on
    /// it before their first scan.
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;

        let scan_engine = if config.disable_scanner {
            info!("scanner disabled; downloads feed the archiver directly");
            None
        } else {
            scan::check_definitions_path(&config.definitions)?;
            Some(scan::spawn_init(&config))
        };

        Ok(Self::assemble(config, store, scan_engine))
    }

    /// Like [`Pipeline::new`] but with a caller-supplied engine instead of the bundled
    /// signature database.
    pub fn with_engine(
        config: Config,
        store: Arc<dyn ObjectStore>,
        engine: Arc<dyn ScanEngine>,
    ) -> Result<Self> {
        config.validate()?;

        let scan_engine = if config.disable_scanner {
            None
        } else {
            let (setter, ready) = ready_pair();
            setter.set(engine);
            Some(ready)
        };

        Ok(Self::assemble(config, store, scan_engine))
    }

    fn assemble(
        config: Config,
        store: Arc<dyn ObjectStore>,
        scan_engine: Option<Ready<Arc<dyn ScanEngine>>>,
    ) -> Self {
        let pool = BufferPool::new(config.max_in_mem as usize);

        Self {
            config: Arc::new(config),
            metrics: Arc::new(Metrics::new()),
            store,
            pool,
            scan_engine,
        }
    }

    /// Shared counters, for progress displays.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Run to completion.  Completing the `abort` future cancels the run: workers stop taking
    /// new tasks, in-flight work winds down, and the run reports as aborted.  Partially written
    /// segments stay on disk and are never recorded in `upload.log`.
    pub async fn run(self, abort: impl Future<Output = ()>) -> Result<()> {
        let cancel = CancellationToken::new();
        let mut stages = Box::pin(self.run_stages(cancel.clone()));

        tokio::select! {
            result = &mut stages => result,
            _ = abort => {
                info!("abort requested, cancelling the pipeline");
                cancel.cancel();
                let _ = stages.await;
                error::AbortedSnafu.fail()
            }
        }
    }

    async fn run_stages(self, cancel: CancellationToken) -> Result<()> {
        // The index is either reused or built by listing the source bucket; either way the
        // totals are known before the first download starts
        let summary = index::load_or_build(&self.store, &self.config).await?;
        self.metrics
            .set_totals(summary.total_objects, summary.total_size);
        info!(
            objects = summary.total_objects,
            bytes = summary.total_size,
            "metadata ready"
        );

        let (errors, error_sink) = events::spawn_sink(&self.config.error_log_path()).await?;

        let (task_tx, task_rx) =
            mpsc::channel::<DownloadTask>(self.config.chan_to_download.max(1));
        let (downloaded_tx, downloaded_rx) =
            mpsc::channel::<WorkFile>(self.config.chan_downloaded.max(1));

        let reader_handle = tokio::spawn(reader::run(
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
            task_tx,
            cancel.clone(),
        ));

        let download_handle = tokio::spawn(download::run(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
            Arc::clone(&self.pool),
            errors.clone(),
            task_rx,
            downloaded_tx,
            cancel.clone(),
        ));

        // With the scanner disabled the archiver consumes the download queue directly
        let (archive_input, scanner_handle) = match &self.scan_engine {
            Some(engine_ready) => {
                let (scanned_tx, scanned_rx) =
                    mpsc::channel::<WorkFile>(self.config.chan_scanned.max(1));
                let handle = tokio::spawn(scanner::run(
                    engine_ready.clone(),
                    Arc::clone(&self.config),
                    Arc::clone(&self.metrics),
                    errors.clone(),
                    downloaded_rx,
                    scanned_tx,
                    cancel.clone(),
                ));
                (scanned_rx, Some(handle))
            }
            None => (downloaded_rx, None),
        };

        let (archive_tx, archive_rx) = mpsc::channel(self.config.chan_archive.max(1));
        let archiver_handle = {
            let config = Arc::clone(&self.config);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                archiver::run_blocking(config, archive_input, archive_tx, cancel)
            })
        };

        let uploader_handle = tokio::spawn(upload::run(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
            self.upload_metadata().await,
            archive_rx,
            cancel.clone(),
        ));

        // The pipeline's own sender must go away or the sink would never see the bus close
        drop(errors);

        // Shutdown cascades from the reader down; a stage that fails drops its channel ends and
        // unblocks everything above it, so these joins always make progress.  The uploader is
        // last, per the shutdown ordering contract.
        reader_handle.await.context(error::StageJoinSnafu)??;
        debug!("reader finished");
        download_handle.await.context(error::StageJoinSnafu)?;
        debug!("downloader finished");
        if let Some(handle) = scanner_handle {
            handle.await.context(error::StageJoinSnafu)??;
            debug!("scanner finished");
        }
        archiver_handle.await.context(error::StageJoinSnafu)??;
        debug!("archiver finished");
        uploader_handle.await.context(error::StageJoinSnafu)??;
        debug!("uploader finished");

        // Every bus sender is gone now; wait for the sink to flush error.log
        error_sink.await.context(error::StageJoinSnafu)?;

        let snapshot = self.metrics.snapshot();
        info!(
            downloaded = snapshot.downloaded_files,
            scanned = snapshot.scanned_files,
            segments = snapshot.uploaded_files,
            archived = snapshot.uploaded_archived_files,
            "pipeline complete"
        );

        Ok(())
    }

    /// The scan description stamped on every uploaded segment.
    async fn upload_metadata(&self) -> HashMap<String, String> {
        match &self.scan_engine {
            Some(engine_ready) => match engine_ready.wait().await {
                Some(engine) => engine.metadata().as_upload_metadata(),
                // Init failure surfaces in the scanner stage; metadata just degrades
                None => disabled_scan_metadata(),
            },
            None => disabled_scan_metadata(),
        }
    }
}

fn disabled_scan_metadata() -> HashMap<String, String> {
    HashMap::from([
        ("vendor".to_string(), "none".to_string()),
        ("version".to_string(), "0".to_string()),
        (
            "signature_date".to_string(),
            chrono::Utc::now().to_rfc3339(),
        ),
        ("result".to_string(), "skipped".to_string()),
    ])
}
