//! Metadata indexer.
//!
//! A run is driven off a local `metadata.jsonl` file: one `{"key":…,"size":…}` record per source
//! object, terminated by a `{"total_objects":…,"total_size":…}` summary line.  If the file is
//! already present from an earlier run we trust it and recover the totals from the summary line
//! near end-of-file instead of re-listing the bucket; otherwise the source bucket is paginated
//! and the file written fresh.  A listing failure is fatal and removes the partial file so a
//! half-written index is never trusted on the next run.

use crate::objstore::ObjectStore;
use crate::{error, Config, Result};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info};

/// How far back from end-of-file to look for the summary line.
const SUMMARY_TAIL_WINDOW: u64 = 1000;

/// One line of `metadata.jsonl`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub(crate) struct MetaEntry {
    pub key: String,
    pub size: u64,
}

/// The trailing summary line of `metadata.jsonl`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IndexSummary {
    pub total_objects: u64,
    pub total_size: u64,
}

/// Reuse an existing index or build one by listing the source bucket.
pub(crate) async fn load_or_build(
    store: &Arc<dyn ObjectStore>,
    config: &Config,
) -> Result<IndexSummary> {
    let path = config.metadata_path();

    match tokio::fs::metadata(&path).await {
        Ok(_) => {
            info!(path = %path.display(), "metadata index already exists, reusing it");
            read_summary(&path).await
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "building metadata index");
            match build_index(store, config, &path).await {
                Ok(summary) => Ok(summary),
                Err(e) => {
                    // Never leave a partial index behind for the next run to trust
                    let _ = tokio::fs::remove_file(&path).await;
                    Err(e)
                }
            }
        }
        Err(source) => Err(source).context(error::ReadIndexSnafu { path }),
    }
}

/// Recover the totals from the summary line without reading the whole file.
pub(crate) async fn read_summary(path: &Path) -> Result<IndexSummary> {
    let mut file = tokio::fs::File::open(path)
        .await
        .context(error::ReadIndexSnafu { path })?;
    let len = file
        .metadata()
        .await
        .context(error::ReadIndexSnafu { path })?
        .len();
    ensure!(len > 0, error::MissingIndexSummarySnafu { path });

    let offset = len.saturating_sub(SUMMARY_TAIL_WINDOW);
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .context(error::ReadIndexSnafu { path })?;

    let mut tail = Vec::with_capacity(SUMMARY_TAIL_WINDOW as usize);
    file.read_to_end(&mut tail)
        .await
        .context(error::ReadIndexSnafu { path })?;

    // Entry lines in the window fail to parse as a summary, so the last parseable line wins
    let summary = tail
        .split(|&b| b == b'\n')
        .filter_map(|line| serde_json::from_slice::<IndexSummary>(line).ok())
        .last();

    summary.context(error::MissingIndexSummarySnafu { path })
}

async fn build_index(
    store: &Arc<dyn ObjectStore>,
    config: &Config,
    path: &Path,
) -> Result<IndexSummary> {
    let file = tokio::fs::File::create(path)
        .await
        .context(error::WriteIndexSnafu { path })?;
    let mut writer = BufWriter::new(file);

    let delimiter = config.prefix_delimiter.then_some("/");
    let mut continuation: Option<String> = None;
    let mut summary = IndexSummary {
        total_objects: 0,
        total_size: 0,
    };

    loop {
        let page = store
            .list_page(
                &config.src_bucket,
                config.prefix_filter.as_deref(),
                delimiter,
                continuation,
            )
            .await?;

        for entry in &page.entries {
            let mut line = serde_json::to_vec(&MetaEntry {
                key: entry.key.clone(),
                size: entry.size,
            })
            .expect("metadata entries always serialize");
            line.push(b'\n');
            writer
                .write_all(&line)
                .await
                .context(error::WriteIndexSnafu { path })?;

            summary.total_objects += 1;
            summary.total_size += entry.size;
        }

        debug!(
            page_entries = page.entries.len(),
            objects = summary.total_objects,
            "indexed listing page"
        );

        continuation = page.next;
        if continuation.is_none() {
            break;
        }
    }

    let mut line =
        serde_json::to_vec(&summary).expect("metadata summaries always serialize");
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .context(error::WriteIndexSnafu { path })?;
    writer.flush().await.context(error::WriteIndexSnafu { path })?;

    info!(
        objects = summary.total_objects,
        bytes = summary.total_size,
        path = %path.display(),
        "metadata index written"
    );

    Ok(summary)
}
