//! Archiver stage: the single writer.
//!
//! The tar+gzip writer is stateful, so exactly one worker owns it.  It packs incoming
//! [`WorkFile`]s into the open segment in arrival order, rolling to a new segment *before*
//! packing the first object that would push the uncompressed payload strictly past the size cap.
//! An object bigger than the cap still gets packed, alone in its own segment.  Each closed
//! segment is handed to the uploader together with the manifest of keys it contains.
//!
//! Compression is gzip at best-speed; the inputs are mostly already-compressed or opaque blobs,
//! so a higher level buys almost nothing per cycle spent.

use crate::download::{WorkFile, WorkPayload};
use crate::{error, Config, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use snafu::prelude::*;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A closed segment ready for upload.
#[derive(Debug)]
pub(crate) struct ArchiveFile {
    /// Destination key, rendered from the archive name template.
    pub name: String,
    /// Where the segment lives locally until the upload succeeds.
    pub path: PathBuf,
    /// Source keys packed into this segment, in packing order.
    pub contents: Vec<String>,
    /// Uncompressed payload bytes packed.
    pub uncompressed: u64,
}

/// An `archive_%07d.tgz`-style name template: literal text around one `%Nd` integer slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SegmentTemplate {
    prefix: String,
    suffix: String,
    width: usize,
}

impl SegmentTemplate {
    pub(crate) fn parse(template: &str) -> Result<Self> {
        let fail = || error::InvalidArchiveTemplateSnafu { template }.build();

        let percent = template.find('%').ok_or_else(fail)?;
        let prefix = template[..percent].to_string();
        let rest = &template[percent + 1..];

        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(fail)?;
        let width: usize = rest[..digits_end].parse().unwrap_or(0);
        ensure!(
            rest[digits_end..].starts_with('d'),
            error::InvalidArchiveTemplateSnafu { template }
        );

        let suffix = rest[digits_end + 1..].to_string();
        ensure!(
            !suffix.contains('%'),
            error::InvalidArchiveTemplateSnafu { template }
        );

        Ok(Self {
            prefix,
            suffix,
            width,
        })
    }

    pub(crate) fn render(&self, index: u64) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            index,
            self.suffix,
            width = self.width
        )
    }
}

struct OpenSegment {
    name: String,
    path: PathBuf,
    builder: tar::Builder<GzEncoder<std::fs::File>>,
    used: u64,
    contents: Vec<String>,
}

impl OpenSegment {
    fn create(config: &Config, name: String) -> Result<Self> {
        let path = config.work_dir.join(&name);
        let file = std::fs::File::create(&path).context(error::CreateSegmentSnafu { path: &path })?;
        let encoder = GzEncoder::new(file, Compression::fast());

        debug!(segment = %name, "opened archive segment");

        Ok(Self {
            name,
            path,
            builder: tar::Builder::new(encoder),
            used: 0,
            contents: Vec::new(),
        })
    }

    fn append(&mut self, file: WorkFile) -> Result<()> {
        let mut header = tar::Header::new_ustar();
        header.set_mode(0o600);
        header.set_size(file.size);

        match &file.payload {
            WorkPayload::Inline(buf) => {
                self.builder
                    .append_data(&mut header, &file.key, &buf[..])
                    .context(error::AppendSegmentSnafu { key: &file.key })?;
            }
            WorkPayload::Spilled(temp) => {
                let spill = std::fs::File::open(temp)
                    .context(error::AppendSegmentSnafu { key: &file.key })?;
                self.builder
                    .append_data(&mut header, &file.key, spill)
                    .context(error::AppendSegmentSnafu { key: &file.key })?;
            }
        }

        // Payload drops here: buffer back to the pool, temp file unlinked
        self.used += file.size;
        self.contents.push(file.key);

        Ok(())
    }

    fn finish(self) -> Result<ArchiveFile> {
        let encoder = self
            .builder
            .into_inner()
            .context(error::FinishSegmentSnafu { path: &self.path })?;
        let mut file = encoder
            .finish()
            .context(error::FinishSegmentSnafu { path: &self.path })?;
        file.flush()
            .context(error::FinishSegmentSnafu { path: &self.path })?;

        info!(
            segment = %self.name,
            objects = self.contents.len(),
            uncompressed = self.used,
            "closed archive segment"
        );

        Ok(ArchiveFile {
            name: self.name,
            path: self.path,
            contents: self.contents,
            uncompressed: self.used,
        })
    }
}

/// The archiver loop.  Runs on a blocking thread; all tar and gzip I/O is synchronous.
pub(crate) fn run_blocking(
    config: Arc<Config>,
    mut input: mpsc::Receiver<WorkFile>,
    out: mpsc::Sender<ArchiveFile>,
    cancel: CancellationToken,
) -> Result<()> {
    let template = SegmentTemplate::parse(&config.archive_name)?;
    let mut open: Option<OpenSegment> = None;
    let mut next_index = 0u64;

    while let Some(file) = input.blocking_recv() {
        if cancel.is_cancelled() {
            break;
        }

        // Roll before packing the object that would burst the cap
        if let Some(segment) = &open {
            if segment.used > 0 && segment.used + file.size > config.size_cap {
                let finished = open.take().expect("segment is open").finish()?;
                if out.blocking_send(finished).is_err() {
                    // Uploader is gone; its error is the one that matters
                    return Ok(());
                }
            }
        }

        if open.is_none() {
            open = Some(OpenSegment::create(&config, template.render(next_index))?);
            next_index += 1;
        }

        open.as_mut().expect("segment just opened").append(file)?;
    }

    // Input closed (or cancelled): flush whatever is open.  A segment is only ever open if it
    // holds at least one entry, so an empty segment never closes.
    if let Some(segment) = open.take() {
        let finished = segment.finish()?;
        let _ = out.blocking_send(finished);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn template_roundtrip(template: &str, index: u64) -> String {
        SegmentTemplate::parse(template).unwrap().render(index)
    }

    #[test]
    fn template_renders_padded_indexes() {
        assert_eq!(template_roundtrip("archive_%07d.tgz", 0), "archive_0000000.tgz");
        assert_eq!(template_roundtrip("archive_%07d.tgz", 42), "archive_0000042.tgz");
        assert_eq!(template_roundtrip("seg-%03d.tar.gz", 7), "seg-007.tar.gz");
        assert_eq!(template_roundtrip("plain%d.tgz", 12), "plain12.tgz");
    }

    #[test]
    fn template_rejects_missing_or_duplicate_slots() {
        assert!(SegmentTemplate::parse("archive.tgz").is_err());
        assert!(SegmentTemplate::parse("archive_%s.tgz").is_err());
        assert!(SegmentTemplate::parse("a_%02d_b_%02d.tgz").is_err());
        assert!(SegmentTemplate::parse("archive_%07").is_err());
    }

    fn inline_file(pool: &Arc<BufferPool>, key: &str, data: &[u8]) -> WorkFile {
        let mut buf = pool.acquire(data.len());
        buf.copy_from_slice(data);
        WorkFile {
            key: key.to_string(),
            size: data.len() as u64,
            payload: WorkPayload::Inline(buf),
        }
    }

    fn read_segment(archive: &ArchiveFile) -> Vec<(String, Vec<u8>)> {
        let file = std::fs::File::open(&archive.path).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(file));

        tar.entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                assert_eq!(entry.header().mode().unwrap(), 0o600);
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (path, data)
            })
            .collect()
    }

    async fn run_archiver(config: Config, files: Vec<WorkFile>) -> Vec<ArchiveFile> {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let handle =
            tokio::task::spawn_blocking(move || run_blocking(config, in_rx, out_tx, cancel));

        for file in files {
            in_tx.send(file).await.unwrap();
        }
        drop(in_tx);

        let mut segments = Vec::new();
        while let Some(segment) = out_rx.recv().await {
            segments.push(segment);
        }
        handle.await.unwrap().unwrap();

        segments
    }

    fn test_config(dir: &std::path::Path, size_cap: u64) -> Config {
        Config {
            src_bucket: "src".into(),
            dst_bucket: "dst".into(),
            size_cap,
            work_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn rolls_before_bursting_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(96 * 1024);

        let files = vec![
            inline_file(&pool, "a.txt", &[b'a'; 50]),
            inline_file(&pool, "b.txt", &[b'b'; 50]),
        ];
        let segments = run_archiver(test_config(dir.path(), 60), files).await;

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].name, "archive_0000000.tgz");
        assert_eq!(segments[1].name, "archive_0000001.tgz");
        assert_eq!(segments[0].contents, vec!["a.txt"]);
        assert_eq!(segments[1].contents, vec!["b.txt"]);
        assert_eq!(segments[0].uncompressed, 50);

        let entries = read_segment(&segments[0]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "a.txt");
        assert_eq!(entries[0].1, vec![b'a'; 50]);
    }

    #[tokio::test]
    async fn object_exactly_at_cap_packs_then_segment_closes_on_next() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(96 * 1024);

        let files = vec![
            inline_file(&pool, "full.bin", &[b'x'; 100]),
            inline_file(&pool, "next.bin", &[b'y'; 10]),
        ];
        let segments = run_archiver(test_config(dir.path(), 100), files).await;

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].contents, vec!["full.bin"]);
        assert_eq!(segments[1].contents, vec!["next.bin"]);
    }

    #[tokio::test]
    async fn oversized_object_gets_its_own_segment() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(96 * 1024);

        let files = vec![
            inline_file(&pool, "small.bin", &[b's'; 40]),
            inline_file(&pool, "huge.bin", &[b'h'; 500]),
            inline_file(&pool, "tail.bin", &[b't'; 40]),
        ];
        let segments = run_archiver(test_config(dir.path(), 100), files).await;

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].contents, vec!["small.bin"]);
        assert_eq!(segments[1].contents, vec!["huge.bin"]);
        assert_eq!(segments[1].uncompressed, 500);
        assert_eq!(segments[2].contents, vec!["tail.bin"]);
    }

    #[tokio::test]
    async fn multiple_objects_share_a_segment_under_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(96 * 1024);

        let files = vec![
            inline_file(&pool, "one", &[1u8; 10]),
            inline_file(&pool, "two", &[2u8; 10]),
            inline_file(&pool, "three", &[3u8; 10]),
        ];
        let segments = run_archiver(test_config(dir.path(), 1000), files).await;

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].contents, vec!["one", "two", "three"]);
        assert_eq!(segments[0].uncompressed, 30);

        let entries = read_segment(&segments[0]);
        assert_eq!(
            entries.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["one", "two", "three"]
        );
    }

    #[tokio::test]
    async fn zero_byte_object_is_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(96 * 1024);

        let files = vec![inline_file(&pool, "empty.txt", &[])];
        let segments = run_archiver(test_config(dir.path(), 100), files).await;

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].uncompressed, 0);

        let entries = read_segment(&segments[0]);
        assert_eq!(entries[0].0, "empty.txt");
        assert!(entries[0].1.is_empty());
    }

    #[tokio::test]
    async fn spilled_payload_is_packed_and_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(96 * 1024);

        let data = vec![7u8; 4096];
        let temp = tempfile::Builder::new()
            .prefix("s3obj-")
            .suffix(".bin")
            .tempfile()
            .unwrap();
        std::fs::write(temp.path(), &data).unwrap();
        let temp_path = temp.into_temp_path();
        let spill_location = temp_path.to_path_buf();

        let files = vec![
            WorkFile {
                key: "spilled/big.bin".to_string(),
                size: data.len() as u64,
                payload: WorkPayload::Spilled(temp_path),
            },
            inline_file(&pool, "small.txt", b"hello"),
        ];
        let segments = run_archiver(test_config(dir.path(), 1 << 20), files).await;

        assert_eq!(segments.len(), 1);
        let entries = read_segment(&segments[0]);
        assert_eq!(entries[0].0, "spilled/big.bin");
        assert_eq!(entries[0].1, data);
        assert_eq!(entries[1].0, "small.txt");

        assert!(
            !spill_location.exists(),
            "temp spill file should be unlinked after packing"
        );
    }

    #[tokio::test]
    async fn no_input_produces_no_segments() {
        let dir = tempfile::tempdir().unwrap();
        let segments = run_archiver(test_config(dir.path(), 100), Vec::new()).await;
        assert!(segments.is_empty());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "no segment files should exist");
    }
}
