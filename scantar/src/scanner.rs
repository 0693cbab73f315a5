//! Scanner stage.
//!
//! Workers block until the signature database has loaded and the engine compiled, then scan each
//! incoming [`WorkFile`] — in place for inline payloads, by path for spilled ones.  Clean files
//! are forwarded untouched; infected files and scan failures are dropped and reported.
//! Zero-byte objects skip the engine entirely but still count as scan attempts.

use crate::download::{WorkFile, WorkPayload};
use crate::events::{post, ErrorEvent, ErrorSender};
use crate::metrics::Metrics;
use crate::ready::Ready;
use crate::scan::{ScanEngine, ScanOutcome};
use crate::{error, Config, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) async fn run(
    engine_ready: Ready<Arc<dyn ScanEngine>>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    errors: ErrorSender,
    input: mpsc::Receiver<WorkFile>,
    out: mpsc::Sender<WorkFile>,
    cancel: CancellationToken,
) -> Result<()> {
    // All workers gate on the same engine; a failed init tears the pipeline down
    let engine = match engine_ready.wait().await {
        Some(engine) => engine,
        None => return error::ScanEngineInitSnafu.fail(),
    };
    info!(
        vendor = %engine.metadata().vendor,
        version = %engine.metadata().version,
        "scanner ready"
    );

    let stream = ReceiverStream::new(input)
        .map(|file| {
            let engine = Arc::clone(&engine);
            let metrics = Arc::clone(&metrics);
            let errors = errors.clone();
            let out = out.clone();

            async move {
                scan_one(engine, metrics, errors, out, file).await;
            }
        })
        .buffer_unordered(config.scan_concurrency.max(1));
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => {
                if next.is_none() {
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn scan_one(
    engine: Arc<dyn ScanEngine>,
    metrics: Arc<Metrics>,
    errors: ErrorSender,
    out: mpsc::Sender<WorkFile>,
    file: WorkFile,
) {
    // Every attempt counts, whatever its outcome
    metrics.add_scanned_file();

    if file.size == 0 {
        let _ = out.send(file).await;
        return;
    }

    // The engine is CPU-bound (and blocking for spilled payloads), so it runs off the async
    // worker threads
    let scanned = tokio::task::spawn_blocking(move || {
        let outcome = match &file.payload {
            WorkPayload::Inline(buf) => engine.scan_buffer(buf, &file.key),
            WorkPayload::Spilled(path) => engine.scan_path(path, &file.key),
        };
        (file, outcome)
    })
    .await;

    let (file, outcome) = match scanned {
        Ok(result) => result,
        Err(e) => {
            // The payload died with the panicked task; all we can do is report it
            post(
                &errors,
                ErrorEvent {
                    filename: String::new(),
                    size: 0,
                    read: 0,
                    err: format!("scan worker failed: {e}"),
                },
            )
            .await;
            return;
        }
    };

    match outcome {
        ScanOutcome::Clean => {
            debug!(key = %file.key, "scan clean");
            let _ = out.send(file).await;
        }
        ScanOutcome::Infected { virus } => {
            post(
                &errors,
                ErrorEvent {
                    filename: file.key.clone(),
                    size: file.size,
                    read: 0,
                    err: format!("virus found in {}: {virus}", file.key),
                },
            )
            .await;
            // Dropping the file releases its buffer or unlinks its temp file
        }
        ScanOutcome::Failed { message } => {
            post(
                &errors,
                ErrorEvent {
                    filename: file.key.clone(),
                    size: file.size,
                    read: 0,
                    err: format!("error scanning {}: {message}", file.key),
                },
            )
            .await;
        }
    }
}
