//! The live status line.
//!
//! One progress bar tracks the download leg (bytes of the advertised total), refreshed every
//! 100 ms from the shared counters; scan and upload progress ride along in the message.  Hidden
//! under DEBUG, where the log stream replaces it.

use indicatif::{ProgressBar, ProgressStyle};
use scantar::{humanize_bytes, humanize_rate, Metrics, MetricsSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

pub struct ProgressReporter {
    handle: tokio::task::JoinHandle<()>,
    stop: watch::Sender<bool>,
    metrics: Arc<Metrics>,
}

pub fn spawn(metrics: Arc<Metrics>, hidden: bool) -> ProgressReporter {
    let bar = if hidden {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(0)
    };
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:25.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta}) {msg}",
        )
        .expect("progress template is valid")
        .progress_chars("#>-"),
    );

    let (stop, mut stopped) = watch::channel(false);

    let handle = {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            let mut last = MetricsSnapshot::default();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }

                let snapshot = metrics.snapshot();

                bar.set_length(snapshot.total_bytes);
                bar.set_position(snapshot.downloaded_bytes);
                bar.set_message(format!(
                    "{}/{} files | scanned {} | uploaded {} segs, {} objs, {} ({})",
                    snapshot.downloaded_files,
                    snapshot.total_files,
                    snapshot.scanned_files,
                    snapshot.uploaded_files,
                    snapshot.uploaded_archived_files,
                    humanize_bytes(snapshot.uploaded_bytes),
                    humanize_rate(
                        snapshot.uploaded_bytes - last.uploaded_bytes,
                        REFRESH_INTERVAL
                    ),
                ));

                last = snapshot;
            }

            bar.finish_and_clear();
        })
    };

    ProgressReporter {
        handle,
        stop,
        metrics,
    }
}

impl ProgressReporter {
    /// Stop the display and return the final counters.
    pub async fn finish(self) -> MetricsSnapshot {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
        self.metrics.snapshot()
    }
}
