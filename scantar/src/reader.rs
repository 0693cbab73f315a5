//! Reader stage: metadata lines in, download tasks out.
//!
//! Streams `metadata.jsonl` line by line, applies the resume filter from `upload.log` and the
//! optional `SUBSET` stride selector, and emits one [`DownloadTask`] per remaining entry into the
//! bounded download queue.  Closing the queue when the file is exhausted starts the shutdown
//! cascade through the rest of the pipeline.

use crate::download::DownloadTask;
use crate::index::MetaEntry;
use crate::metrics::Metrics;
use crate::{error, Config, Result};
use snafu::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A 1-based line selector `START:STRIDE[:END]`.
///
/// Line `N` is included iff `N > start`, `(N − start) mod stride == 1` (trivially true for
/// stride 1), and `N ≤ end` when an end is given.  `END` may be `-1` for "no end".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Subset {
    pub start: u64,
    pub stride: u64,
    pub end: Option<u64>,
}

impl Subset {
    pub(crate) fn parse(input: &str) -> Result<Self> {
        let fail = || error::InvalidSubsetSnafu { input }.build();

        let mut fields = input.split(':');
        let start = fields
            .next()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(fail)?;
        let stride: u64 = fields
            .next()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(fail)?;
        let end = match fields.next() {
            None => None,
            Some(s) if s.trim() == "-1" => None,
            Some(s) => Some(s.trim().parse().map_err(|_| fail())?),
        };

        ensure!(
            stride >= 1 && fields.next().is_none(),
            error::InvalidSubsetSnafu { input }
        );

        Ok(Self { start, stride, end })
    }

    pub(crate) fn includes(&self, line: u64) -> bool {
        if line <= self.start {
            return false;
        }
        if let Some(end) = self.end {
            if line > end {
                return false;
            }
        }
        self.stride == 1 || (line - self.start) % self.stride == 1
    }

    fn past_end(&self, line: u64) -> bool {
        matches!(self.end, Some(end) if line > end)
    }
}

/// Read `upload.log` into the set of keys to skip on resume.  A missing log just means a fresh
/// run.
pub(crate) fn load_skip_set(path: &Path) -> Result<HashSet<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(source) => Err(source).context(error::ReadUploadLogSnafu { path }),
    }
}

pub(crate) async fn run(
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    tasks: mpsc::Sender<DownloadTask>,
    cancel: CancellationToken,
) -> Result<()> {
    let skip = load_skip_set(&config.upload_log_path())?;
    if !skip.is_empty() {
        info!(already_archived = skip.len(), "resuming from upload log");
    }

    let subset = config.subset.as_deref().map(Subset::parse).transpose()?;
    let path = config.metadata_path();

    // With a subset in play the advertised totals from the index summary are wrong; recompute
    // them over the selected lines before emitting the first task
    if let Some(subset) = &subset {
        let (files, bytes) = subset_totals(&path, subset).await?;
        metrics.set_totals(files, bytes);
        info!(files, bytes, ?subset, "totals recomputed for subset");
    }

    let file = tokio::fs::File::open(&path)
        .await
        .context(error::ReadIndexSnafu { path: &path })?;
    let mut lines = tokio::io::BufReader::new(file).lines();

    let mut line_number = 0u64;
    while let Some(line) = lines
        .next_line()
        .await
        .context(error::ReadIndexSnafu { path: &path })?
    {
        line_number += 1;

        if let Some(subset) = &subset {
            if subset.past_end(line_number) {
                break;
            }
            if !subset.includes(line_number) {
                continue;
            }
        }

        // The summary trailer (or a truncated final line) ends the entry stream
        let entry: MetaEntry = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            Err(_) => break,
        };
        if entry.key.is_empty() {
            break;
        }

        if skip.contains(&entry.key) {
            debug!(key = %entry.key, "already archived, skipping");
            metrics.discount_total(entry.size);
            continue;
        }

        let task = DownloadTask {
            key: entry.key,
            size: entry.size,
        };
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = tasks.send(task) => {
                if sent.is_err() {
                    // Downstream is gone; nothing left to feed
                    break;
                }
            }
        }
    }

    Ok(())
}

/// First pass over the metadata file accumulating totals for the selected lines.
async fn subset_totals(path: &Path, subset: &Subset) -> Result<(u64, u64)> {
    let file = tokio::fs::File::open(path)
        .await
        .context(error::ReadIndexSnafu { path })?;
    let mut lines = tokio::io::BufReader::new(file).lines();

    let mut files = 0u64;
    let mut bytes = 0u64;
    let mut line_number = 0u64;

    while let Some(line) = lines
        .next_line()
        .await
        .context(error::ReadIndexSnafu { path })?
    {
        line_number += 1;
        if subset.past_end(line_number) {
            break;
        }
        if !subset.includes(line_number) {
            continue;
        }

        let entry: MetaEntry = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            Err(_) => break,
        };
        if entry.key.is_empty() {
            break;
        }

        files += 1;
        bytes += entry.size;
    }

    Ok((files, bytes))
}
