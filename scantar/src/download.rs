//! Download stage.
//!
//! A pool of fetch workers turns [`DownloadTask`]s into [`WorkFile`]s.  Small objects (at or
//! below the in-memory threshold) are read straight into a pooled buffer with a single GET;
//! anything larger is spilled to a pre-allocated temp file filled by parallel ranged GETs.  A
//! task that fails produces exactly one event on the error bus and no `WorkFile` — the rest of
//! the pipeline never sees it.

use crate::config::{DOWNLOAD_PART_COUNT, MULTIPART_DOWNLOAD_THRESHOLD};
use crate::events::{post, ErrorEvent, ErrorSender};
use crate::metrics::Metrics;
use crate::objstore::ObjectStore;
use crate::pool::{BufferPool, PooledBuf};
use crate::Config;
use futures::StreamExt;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One object to fetch, as emitted by the reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DownloadTask {
    pub key: String,
    pub size: u64,
}

/// Where a downloaded object's bytes live.
///
/// Dropping the payload releases it: an inline buffer goes back to the pool, a spilled temp file
/// is unlinked.  Whichever stage holds the `WorkFile` when something goes wrong just drops it.
pub(crate) enum WorkPayload {
    Inline(PooledBuf),
    Spilled(TempPath),
}

/// A downloaded object in flight between the downloader, scanner and archiver.
pub(crate) struct WorkFile {
    pub key: String,
    pub size: u64,
    pub payload: WorkPayload,
}

struct DownloadCtx {
    store: Arc<dyn ObjectStore>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    pool: Arc<BufferPool>,
}

pub(crate) async fn run(
    store: Arc<dyn ObjectStore>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    pool: Arc<BufferPool>,
    errors: ErrorSender,
    tasks: mpsc::Receiver<DownloadTask>,
    out: mpsc::Sender<WorkFile>,
    cancel: CancellationToken,
) {
    let ctx = Arc::new(DownloadCtx {
        store,
        config: Arc::clone(&config),
        metrics,
        pool,
    });

    let stream = ReceiverStream::new(tasks)
        .map(|task| {
            let ctx = Arc::clone(&ctx);
            let errors = errors.clone();
            let out = out.clone();

            async move {
                match download_one(&ctx, &task).await {
                    Ok(file) => {
                        ctx.metrics.add_downloaded_file();
                        // A closed channel means the pipeline is tearing down; the payload is
                        // released by the drop
                        let _ = out.send(file).await;
                    }
                    Err(event) => post(&errors, event).await,
                }
            }
        })
        .buffer_unordered(config.download_concurrency.max(1));
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
}

async fn download_one(ctx: &DownloadCtx, task: &DownloadTask) -> Result<WorkFile, ErrorEvent> {
    if task.size <= ctx.config.max_in_mem {
        download_inline(ctx, task).await
    } else {
        download_spilled(ctx, task).await
    }
}

/// Single GET into a pooled buffer.
async fn download_inline(ctx: &DownloadCtx, task: &DownloadTask) -> Result<WorkFile, ErrorEvent> {
    let event = |read: u64, err: String| ErrorEvent {
        filename: task.key.clone(),
        size: task.size,
        read,
        err,
    };

    let mut buf = ctx.pool.acquire(task.size as usize);

    let mut body = ctx
        .store
        .get_object(&ctx.config.src_bucket, &task.key, None)
        .await
        .map_err(|e| event(0, format!("error downloading object {}: {e}", task.key)))?;

    let mut offset = 0usize;
    while let Some(chunk) = body.next().await {
        let chunk = chunk
            .map_err(|e| event(offset as u64, format!("error reading object {}: {e}", task.key)))?;

        let end = offset + chunk.len();
        if end > buf.len() {
            return Err(event(
                offset as u64,
                format!(
                    "object {} is larger than its advertised {} bytes",
                    task.key, task.size
                ),
            ));
        }

        buf[offset..end].copy_from_slice(&chunk);
        ctx.metrics.add_downloaded_bytes(chunk.len() as u64);
        offset = end;
    }

    if offset as u64 != task.size {
        return Err(event(
            offset as u64,
            format!(
                "short read for object {}: expected {}, got {offset}",
                task.key, task.size
            ),
        ));
    }

    Ok(WorkFile {
        key: task.key.clone(),
        size: task.size,
        payload: WorkPayload::Inline(buf),
    })
}

/// Ranged parallel GETs into a pre-allocated temp file.
async fn download_spilled(ctx: &DownloadCtx, task: &DownloadTask) -> Result<WorkFile, ErrorEvent> {
    let read = Arc::new(AtomicU64::new(0));
    let event = |err: String| ErrorEvent {
        filename: task.key.clone(),
        size: task.size,
        read: read.load(Ordering::Relaxed),
        err,
    };

    let suffix = match Path::new(&task.key).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!(".{ext}"),
        None => ".tmp".to_string(),
    };

    let temp = tempfile::Builder::new()
        .prefix("s3obj-")
        .suffix(&suffix)
        .tempfile()
        .map_err(|e| event(format!("failed to create temp file for {}: {e}", task.key)))?;
    temp.as_file()
        .set_len(task.size)
        .map_err(|e| event(format!("failed to pre-allocate temp file for {}: {e}", task.key)))?;
    // From here the path owns the file; dropping it unlinks
    let temp_path = temp.into_temp_path();

    let part_count = if task.size > MULTIPART_DOWNLOAD_THRESHOLD {
        DOWNLOAD_PART_COUNT
    } else {
        1
    };
    let part_size = task.size / part_count;

    debug!(key = %task.key, size = task.size, part_count, "spilling object to temp file");

    let proceed = Arc::new(AtomicBool::new(true));
    let parts = (0..part_count).map(|i| {
        let start = i * part_size;
        let end = if i == part_count - 1 {
            task.size
        } else {
            (i + 1) * part_size
        };

        download_part(
            ctx,
            &task.key,
            &temp_path,
            i,
            start..end,
            Arc::clone(&proceed),
            Arc::clone(&read),
        )
    });

    let results = futures::future::join_all(parts).await;
    if let Some(err) = results.into_iter().find_map(Result::err) {
        // temp_path drops here, unlinking the partial file
        return Err(event(format!(
            "error downloading object {} to temp file: {err}",
            task.key
        )));
    }

    Ok(WorkFile {
        key: task.key.clone(),
        size: task.size,
        payload: WorkPayload::Spilled(temp_path),
    })
}

async fn download_part(
    ctx: &DownloadCtx,
    key: &str,
    path: &Path,
    part: u64,
    range: Range<u64>,
    proceed: Arc<AtomicBool>,
    read: Arc<AtomicU64>,
) -> Result<(), String> {
    let fail = |message: String| {
        proceed.store(false, Ordering::Relaxed);
        message
    };

    let mut body = ctx
        .store
        .get_object(&ctx.config.src_bucket, key, Some(range.clone()))
        .await
        .map_err(|e| fail(format!("part {part}: failed to get object: {e}")))?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| fail(format!("part {part}: failed to open temp file: {e}")))?;
    file.seek(std::io::SeekFrom::Start(range.start))
        .await
        .map_err(|e| fail(format!("part {part}: seek error: {e}")))?;

    while proceed.load(Ordering::Relaxed) {
        match body.next().await {
            None => break,
            Some(Ok(chunk)) => {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| fail(format!("part {part}: write error: {e}")))?;
                ctx.metrics.add_downloaded_bytes(chunk.len() as u64);
                read.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            Some(Err(e)) => return Err(fail(format!("part {part}: read error: {e}"))),
        }
    }

    file.flush()
        .await
        .map_err(|e| fail(format!("part {part}: flush error: {e}")))?;

    Ok(())
}
