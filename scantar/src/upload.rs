//! Uploader stage.
//!
//! Each closed segment is pushed to the destination bucket with a multipart upload: the local
//! file is split into contiguous byte ranges, the parts go up in parallel from positional
//! section readers over the same file, and the collected etags complete the upload.  Any part
//! failure aborts the multipart upload and — by policy — the run; a segment is only ever
//! recorded in `upload.log` after its upload completed, so a crash or failure here never
//! poisons the resume state.

use crate::archiver::ArchiveFile;
use crate::config::UPLOAD_PART_COUNT;
use crate::metrics::Metrics;
use crate::objstore::ObjectStore;
use crate::{error, Config, Result};
use futures::StreamExt;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct UploadCtx {
    store: Arc<dyn ObjectStore>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    /// `vendor` / `version` / `signature_date` / `result` stamped on every uploaded segment.
    scan_metadata: HashMap<String, String>,
    /// Append handle for `upload.log`; one writer at a time.
    log: Mutex<tokio::io::BufWriter<tokio::fs::File>>,
}

pub(crate) async fn run(
    store: Arc<dyn ObjectStore>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    scan_metadata: HashMap<String, String>,
    input: mpsc::Receiver<ArchiveFile>,
    cancel: CancellationToken,
) -> Result<()> {
    let log_path = config.upload_log_path();
    let log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .context(error::AppendUploadLogSnafu { path: &log_path })?;

    let ctx = Arc::new(UploadCtx {
        store,
        config: Arc::clone(&config),
        metrics,
        scan_metadata,
        log: Mutex::new(tokio::io::BufWriter::new(log)),
    });

    let stream = ReceiverStream::new(input)
        .map(|segment| {
            let ctx = Arc::clone(&ctx);
            async move { upload_segment(&ctx, segment).await }
        })
        .buffer_unordered(config.upload_concurrency.max(1));
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => {
                match next {
                    // A failed segment upload is fatal; the local file stays on disk for a
                    // later retry and its contents never reach upload.log
                    Some(Err(e)) => return Err(e),
                    Some(Ok(())) => {}
                    None => break,
                }
            }
        }
    }

    Ok(())
}

async fn upload_segment(ctx: &UploadCtx, segment: ArchiveFile) -> Result<()> {
    let size = tokio::fs::metadata(&segment.path)
        .await
        .context(error::ReadSegmentSnafu {
            path: &segment.path,
        })?
        .len();

    debug!(segment = %segment.name, size, "starting multipart upload");

    let upload_id = ctx
        .store
        .create_multipart(&ctx.config.dst_bucket, &segment.name, &ctx.scan_metadata)
        .await?;

    // A segment always compresses to at least a few bytes, but never hand a zero-length part
    // to the store
    let part_count = UPLOAD_PART_COUNT.min(size.max(1));
    let part_size = size / part_count;

    let part_futs = (0..part_count).map(|i| {
        let upload_id = upload_id.clone();
        let start = i * part_size;
        let length = if i == part_count - 1 {
            size - start
        } else {
            part_size
        };

        let segment = &segment;
        let ctx = &ctx;
        async move {
            let part = ctx
                .store
                .upload_part(
                    &ctx.config.dst_bucket,
                    &segment.name,
                    &upload_id,
                    (i + 1) as i32,
                    &segment.path,
                    start,
                    length,
                )
                .await?;
            ctx.metrics.add_uploaded_bytes(length);
            Ok(part)
        }
    });

    let results = futures::future::join_all(part_futs).await;
    let mut parts = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(part) => parts.push(part),
            Err(e) => {
                ctx.store
                    .abort_multipart(&ctx.config.dst_bucket, &segment.name, &upload_id)
                    .await
                    .ok();
                return Err(e);
            }
        }
    }

    ctx.store
        .complete_multipart(&ctx.config.dst_bucket, &segment.name, &upload_id, parts)
        .await?;

    // Only now are the packed keys durably archived; record them for resume
    {
        let log_path = ctx.config.upload_log_path();
        let mut log = ctx.log.lock().await;
        for key in &segment.contents {
            log.write_all(key.as_bytes())
                .await
                .context(error::AppendUploadLogSnafu { path: &log_path })?;
            log.write_all(b"\n")
                .await
                .context(error::AppendUploadLogSnafu { path: &log_path })?;
        }
        log.flush()
            .await
            .context(error::AppendUploadLogSnafu { path: &log_path })?;
    }

    if let Err(e) = tokio::fs::remove_file(&segment.path).await {
        warn!(path = %segment.path.display(), error = %e, "could not remove uploaded segment");
    }

    ctx.metrics
        .add_uploaded_segment(segment.contents.len() as u64);

    info!(
        segment = %segment.name,
        objects = segment.contents.len(),
        uncompressed = segment.uncompressed,
        compressed = size,
        "segment uploaded"
    );

    Ok(())
}
