//! The error bus.
//!
//! Stages report per-object failures here instead of stopping the pipeline.  A single sink task
//! drains the bus and appends one JSON-encoded event per line to `error.log`; closing every
//! sender flushes and ends the sink.

use crate::{error, Result};
use serde::Serialize;
use snafu::prelude::*;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

pub(crate) const ERROR_BUS_DEPTH: usize = 100;

/// A per-object failure.  The object named here was dropped from the run; it reached neither an
/// archive segment nor `upload.log`.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorEvent {
    /// Source key of the object that failed.
    pub filename: String,
    /// Advertised size of the object in bytes.
    pub size: u64,
    /// Bytes actually read before the failure, when known.
    pub read: u64,
    /// Human-readable description of what went wrong.
    pub err: String,
}

/// Sending half of the error bus, cloned into every stage.
pub(crate) type ErrorSender = mpsc::Sender<ErrorEvent>;

/// Post an event without blocking the reporting worker on a slow sink.
///
/// If the bus is saturated the event is still delivered; the await is the backpressure the bus
/// was sized for.  A closed bus only happens during teardown, where dropping the event is fine.
pub(crate) async fn post(errors: &ErrorSender, event: ErrorEvent) {
    warn!(
        filename = %event.filename,
        size = event.size,
        "{}",
        event.err
    );

    if errors.send(event).await.is_err() {
        warn!("error bus closed; event dropped");
    }
}

/// Open `error.log` for appending and spawn the sink task that drains the bus into it.
///
/// Returns the sender side and the sink's join handle; the handle resolves once every sender is
/// dropped and the file is flushed.
pub(crate) async fn spawn_sink(
    log_path: &Path,
) -> Result<(ErrorSender, tokio::task::JoinHandle<()>)> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await
        .context(error::CreateErrorLogSnafu {
            path: log_path.to_owned(),
        })?;

    let (tx, mut rx) = mpsc::channel::<ErrorEvent>(ERROR_BUS_DEPTH);

    let handle = tokio::spawn(async move {
        let mut writer = tokio::io::BufWriter::new(file);

        while let Some(event) = rx.recv().await {
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "could not encode error event");
                    continue;
                }
            };
            line.push(b'\n');

            if let Err(e) = writer.write_all(&line).await {
                warn!(error = %e, "could not append to error log");
            }
        }

        if let Err(e) = writer.flush().await {
            warn!(error = %e, "could not flush error log");
        }
    });

    Ok((tx, handle))
}
