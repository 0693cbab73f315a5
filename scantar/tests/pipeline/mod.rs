//! End-to-end pipeline runs against the in-memory object store: source objects go in, `.tgz`
//! segments come out, and `upload.log`/`error.log` record what happened.
//!
//! Worker pools are pinned to one worker in most tests so arrival order at the archiver matches
//! listing order and segment contents are deterministic.

use scantar::{Config, Metrics, ObjectStore, Pipeline};
use scantar_testing::store::MemoryObjectStore;
use scantar_testing::test_data::{make_test_data, validate_extracted_dir, TestObject};
use scantar_testing::{logging, tar, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SRC: &str = "src-bucket";
const DST: &str = "dst-bucket";

/// The byte pattern our test signature database flags.
const EICAR_MARKER: &[u8] = b"EICAR-TEST";
const EICAR_NAME: &str = "Eicar-Test-Signature";

fn write_definitions(work_dir: &Path) -> PathBuf {
    let defs = work_dir.join("db");
    std::fs::create_dir_all(&defs).unwrap();
    // "EICAR-TEST" in hex
    std::fs::write(
        defs.join("daily.sig"),
        format!("{EICAR_NAME}:45494341522d54455354\n"),
    )
    .unwrap();
    defs
}

fn base_config(work_dir: &Path) -> Config {
    Config {
        src_bucket: SRC.into(),
        dst_bucket: DST.into(),
        definitions: write_definitions(work_dir),
        work_dir: work_dir.to_path_buf(),
        download_concurrency: 1,
        scan_concurrency: 1,
        upload_concurrency: 1,
        ..Config::default()
    }
}

async fn run_pipeline(
    config: Config,
    store: &Arc<MemoryObjectStore>,
) -> scantar::Result<Arc<Metrics>> {
    let pipeline = Pipeline::new(config, Arc::clone(store) as Arc<dyn ObjectStore>)?;
    let metrics = pipeline.metrics();
    pipeline.run(std::future::pending()).await?;
    Ok(metrics)
}

fn upload_log(work_dir: &Path) -> Vec<String> {
    match std::fs::read_to_string(work_dir.join("upload.log")) {
        Ok(contents) => contents.lines().map(str::to_owned).collect(),
        Err(_) => Vec::new(),
    }
}

fn error_log(work_dir: &Path) -> Vec<serde_json::Value> {
    match std::fs::read_to_string(work_dir.join("error.log")) {
        Ok(contents) => contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("error.log lines are JSON"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Pull an uploaded segment out of the destination bucket and extract it to a temp dir.
fn extract_uploaded(store: &MemoryObjectStore, segment: &str) -> tempfile::TempDir {
    let bytes = store
        .object(DST, segment)
        .unwrap_or_else(|| panic!("segment '{segment}' was not uploaded"));

    let local = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(local.path(), &bytes).unwrap();

    tar::extract_tgz(local.path()).unwrap()
}

#[tokio::test]
async fn two_tiny_objects_roll_at_the_cap() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    let data = make_test_data(
        &store,
        SRC,
        [TestObject::new("a.txt", 50), TestObject::new("b.txt", 50)],
    );

    let config = Config {
        size_cap: 60,
        ..base_config(work_dir.path())
    };
    let metrics = run_pipeline(config, &store).await?;

    // One object per segment: packing the second would have burst the 60-byte cap
    assert_eq!(
        store.keys(DST),
        vec!["archive_0000000.tgz", "archive_0000001.tgz"]
    );

    let first = extract_uploaded(&store, "archive_0000000.tgz");
    validate_extracted_dir(&data, first.path(), &["a.txt"])?;
    let second = extract_uploaded(&store, "archive_0000001.tgz");
    validate_extracted_dir(&data, second.path(), &["b.txt"])?;

    let mut logged = upload_log(work_dir.path());
    logged.sort();
    assert_eq!(logged, vec!["a.txt", "b.txt"]);

    // Local segments are deleted once uploaded
    assert!(!work_dir.path().join("archive_0000000.tgz").exists());
    assert!(!work_dir.path().join("archive_0000001.tgz").exists());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.downloaded_files, 2);
    assert_eq!(snapshot.scanned_files, 2);
    assert_eq!(snapshot.uploaded_files, 2);
    assert_eq!(snapshot.uploaded_archived_files, 2);
    assert_eq!(snapshot.downloaded_bytes, 100);

    // Uploaded segments carry the scan description
    let metadata = store
        .object_metadata(DST, "archive_0000000.tgz")
        .expect("uploaded object has user metadata");
    assert_eq!(metadata["result"], "pass");
    assert_eq!(metadata["vendor"], "scantar sigdb");
    assert_eq!(metadata["version"], "1");
    assert!(metadata.contains_key("signature_date"));

    Ok(())
}

#[tokio::test]
async fn tar_entries_use_the_fixed_mode() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    make_test_data(&store, SRC, [TestObject::new("nested/key/file.bin", 300)]);

    run_pipeline(base_config(work_dir.path()), &store).await?;

    let bytes = store.object(DST, "archive_0000000.tgz").unwrap();
    let local = tempfile::NamedTempFile::new()?;
    std::fs::write(local.path(), &bytes)?;

    let entries = tar::list_tgz_entries(local.path())?;
    assert_eq!(entries.len(), 1);
    let (key, size, mode) = &entries[0];
    assert_eq!(key, "nested/key/file.bin");
    assert_eq!(*size, 300);
    assert_eq!(*mode & 0o777, 0o600);

    Ok(())
}

#[tokio::test]
async fn resume_skips_keys_already_in_the_upload_log() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    let data = make_test_data(
        &store,
        SRC,
        [TestObject::new("a.txt", 40), TestObject::new("b.txt", 60)],
    );

    // As if an earlier run archived a.txt and then died
    std::fs::write(work_dir.path().join("upload.log"), "a.txt\n")?;

    let metrics = run_pipeline(base_config(work_dir.path()), &store).await?;

    // Advertised totals drop by the skipped entry
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_files, 1);
    assert_eq!(snapshot.total_bytes, 60);

    // Only b.txt is packed
    assert_eq!(store.keys(DST), vec!["archive_0000000.tgz"]);
    let extracted = extract_uploaded(&store, "archive_0000000.tgz");
    validate_extracted_dir(&data, extracted.path(), &["b.txt"])?;

    let mut logged = upload_log(work_dir.path());
    logged.sort();
    assert_eq!(logged, vec!["a.txt", "b.txt"]);

    Ok(())
}

#[tokio::test]
async fn rerunning_a_complete_run_packs_nothing() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    make_test_data(
        &store,
        SRC,
        [TestObject::new("a.txt", 40), TestObject::new("b.txt", 60)],
    );

    run_pipeline(base_config(work_dir.path()), &store).await?;
    assert_eq!(store.keys(DST).len(), 1);

    // Second run: same metadata.jsonl, same upload.log.  Everything is skipped.
    let metrics = run_pipeline(base_config(work_dir.path()), &store).await?;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_files, 0);
    assert_eq!(snapshot.downloaded_files, 0);
    assert_eq!(snapshot.uploaded_files, 0);
    assert_eq!(store.keys(DST).len(), 1);

    Ok(())
}

#[tokio::test]
async fn large_object_spills_and_survives_byte_exact() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());

    // Over the 8 MiB threshold, so the ranged eight-part path runs
    let size = 9 * 1024 * 1024 + 137;
    let data = make_test_data(&store, SRC, [TestObject::new("blobs/huge.bin", size)]);

    let config = Config {
        download_concurrency: 16,
        ..base_config(work_dir.path())
    };
    let metrics = run_pipeline(config, &store).await?;

    let extracted = extract_uploaded(&store, "archive_0000000.tgz");
    validate_extracted_dir(&data, extracted.path(), &["blobs/huge.bin"])?;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.downloaded_bytes, size as u64);
    assert_eq!(upload_log(work_dir.path()), vec!["blobs/huge.bin"]);

    Ok(())
}

#[tokio::test]
async fn inline_spill_threshold_boundary() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());

    let max_in_mem = Config::default().max_in_mem as usize;
    // One object exactly at the threshold (inline path) and one just past it, which spills but
    // stays under the ranged-download threshold so the one-part path runs
    let data = make_test_data(
        &store,
        SRC,
        [
            TestObject::new("exactly-inline.bin", max_in_mem),
            TestObject::new("just-spilled.bin", max_in_mem + 1),
        ],
    );

    run_pipeline(base_config(work_dir.path()), &store).await?;

    let extracted = extract_uploaded(&store, "archive_0000000.tgz");
    validate_extracted_dir(
        &data,
        extracted.path(),
        &["exactly-inline.bin", "just-spilled.bin"],
    )?;

    Ok(())
}

#[tokio::test]
async fn infected_object_is_dropped_and_reported() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());

    let data = make_test_data(&store, SRC, [TestObject::new("good.bin", 512)]);
    let mut infected = b"harmless prefix ".to_vec();
    infected.extend_from_slice(EICAR_MARKER);
    store.insert_object(SRC, "eicar.com", infected);

    let metrics = run_pipeline(base_config(work_dir.path()), &store).await?;

    // good.bin made it through; eicar.com reached no segment and no upload.log line
    assert_eq!(upload_log(work_dir.path()), vec!["good.bin"]);
    let extracted = extract_uploaded(&store, "archive_0000000.tgz");
    validate_extracted_dir(&data, extracted.path(), &["good.bin"])?;

    let events = error_log(work_dir.path());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["filename"], "eicar.com");
    let message = events[0]["err"].as_str().unwrap();
    assert!(
        message.contains(EICAR_NAME),
        "error should carry the virus name, got: {message}"
    );

    // The infected file still counts as a scan attempt
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.scanned_files, 2);
    assert_eq!(snapshot.uploaded_archived_files, 1);

    Ok(())
}

#[tokio::test]
async fn subset_stride_selects_every_third_entry() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    // Page size 3 also exercises listing pagination over the ten keys
    let store = Arc::new(MemoryObjectStore::with_page_size(3));

    let objects: Vec<TestObject> = (0..10)
        .map(|i| TestObject::new(format!("obj-{i:02}"), 10 * (i + 1)))
        .collect();
    make_test_data(&store, SRC, objects);

    let config = Config {
        subset: Some("0:3".into()),
        size_cap: 1_000_000,
        ..base_config(work_dir.path())
    };
    let metrics = run_pipeline(config, &store).await?;

    // Lines 1, 4, 7, 10 of the metadata file
    let mut logged = upload_log(work_dir.path());
    logged.sort();
    assert_eq!(logged, vec!["obj-00", "obj-03", "obj-06", "obj-09"]);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_files, 4);
    assert_eq!(snapshot.total_bytes, 10 + 40 + 70 + 100);
    assert_eq!(snapshot.uploaded_archived_files, 4);

    Ok(())
}

#[tokio::test]
async fn empty_bucket_shuts_down_cleanly() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());

    let metrics = run_pipeline(base_config(work_dir.path()), &store).await?;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_files, 0);
    assert_eq!(snapshot.uploaded_files, 0);

    // The index exists with a zero summary; nothing was packed or logged
    let metadata = std::fs::read_to_string(work_dir.path().join("metadata.jsonl"))?;
    let summary: serde_json::Value = serde_json::from_str(metadata.trim())?;
    assert_eq!(summary["total_objects"], 0);
    assert!(store.keys(DST).is_empty());
    assert!(upload_log(work_dir.path()).is_empty());

    Ok(())
}

#[tokio::test]
async fn zero_byte_object_bypasses_the_scanner_but_still_archives() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    store.insert_object(SRC, "empty.txt", Vec::<u8>::new());
    make_test_data(&store, SRC, [TestObject::new("full.txt", 10)]);

    let metrics = run_pipeline(base_config(work_dir.path()), &store).await?;

    let mut logged = upload_log(work_dir.path());
    logged.sort();
    assert_eq!(logged, vec!["empty.txt", "full.txt"]);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.scanned_files, 2);

    let bytes = store.object(DST, "archive_0000000.tgz").unwrap();
    let local = tempfile::NamedTempFile::new()?;
    std::fs::write(local.path(), &bytes)?;
    let entries = tar::list_tgz_entries(local.path())?;
    let empty = entries.iter().find(|(key, _, _)| key == "empty.txt").unwrap();
    assert_eq!(empty.1, 0);

    Ok(())
}

#[tokio::test]
async fn per_object_download_failures_do_not_stop_the_run() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    let data = make_test_data(
        &store,
        SRC,
        [
            TestObject::new("broken.bin", 2048),
            TestObject::new("flaky.bin", 2048),
            TestObject::new("ok.bin", 2048),
        ],
    );

    store.fail_get("broken.bin");
    store.fail_get_after("flaky.bin", 512);

    let metrics = run_pipeline(base_config(work_dir.path()), &store).await?;

    assert_eq!(upload_log(work_dir.path()), vec!["ok.bin"]);
    let extracted = extract_uploaded(&store, "archive_0000000.tgz");
    validate_extracted_dir(&data, extracted.path(), &["ok.bin"])?;

    let events = error_log(work_dir.path());
    assert_eq!(events.len(), 2);
    let filenames: Vec<&str> = events
        .iter()
        .map(|event| event["filename"].as_str().unwrap())
        .collect();
    assert!(filenames.contains(&"broken.bin"));
    assert!(filenames.contains(&"flaky.bin"));

    // The mid-body failure recorded how far it got
    let flaky = events
        .iter()
        .find(|event| event["filename"] == "flaky.bin")
        .unwrap();
    assert_eq!(flaky["read"], 512);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.downloaded_files, 1);

    Ok(())
}

#[tokio::test]
async fn short_read_drops_the_object() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    store.insert_object(SRC, "liar.bin", vec![1u8; 100]);
    store.insert_object(SRC, "ok.bin", vec![2u8; 50]);

    // A pre-existing index that advertises the wrong size for liar.bin
    std::fs::write(
        work_dir.path().join("metadata.jsonl"),
        concat!(
            "{\"key\":\"liar.bin\",\"size\":200}\n",
            "{\"key\":\"ok.bin\",\"size\":50}\n",
            "{\"total_objects\":2,\"total_size\":250}\n",
        ),
    )?;

    run_pipeline(base_config(work_dir.path()), &store).await?;

    assert_eq!(upload_log(work_dir.path()), vec!["ok.bin"]);

    let events = error_log(work_dir.path());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["filename"], "liar.bin");
    assert_eq!(events[0]["read"], 100);
    assert!(events[0]["err"].as_str().unwrap().contains("short read"));

    Ok(())
}

#[tokio::test]
async fn segment_upload_failure_is_fatal_and_preserves_state() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    make_test_data(&store, SRC, [TestObject::new("a.txt", 64)]);

    store.fail_parts_for("archive_0000000.tgz");

    let result = run_pipeline(base_config(work_dir.path()), &store).await;
    assert!(result.is_err(), "a failed segment upload stops the run");

    // The multipart upload was aborted, nothing reached upload.log, and the local segment
    // survives for a retry
    assert_eq!(store.aborted_upload_count(), 1);
    assert_eq!(store.pending_upload_count(), 0);
    assert!(upload_log(work_dir.path()).is_empty());
    assert!(work_dir.path().join("archive_0000000.tgz").exists());
    assert!(store.object(DST, "archive_0000000.tgz").is_none());

    Ok(())
}

#[tokio::test]
async fn disabled_scanner_wires_downloads_straight_through() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());

    // Even a flagged payload sails through when scanning is off
    let mut infected = Vec::from(&b"prefix "[..]);
    infected.extend_from_slice(EICAR_MARKER);
    store.insert_object(SRC, "eicar.com", infected);

    let config = Config {
        disable_scanner: true,
        // Nonexistent on purpose: the definitions path must not be touched when disabled
        definitions: work_dir.path().join("no-such-dir"),
        ..base_config(work_dir.path())
    };
    let metrics = run_pipeline(config, &store).await?;

    assert_eq!(upload_log(work_dir.path()), vec!["eicar.com"]);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.scanned_files, 0);
    assert_eq!(snapshot.uploaded_archived_files, 1);

    let metadata = store
        .object_metadata(DST, "archive_0000000.tgz")
        .expect("uploaded object has user metadata");
    assert_eq!(metadata["result"], "skipped");
    assert_eq!(metadata["vendor"], "none");

    Ok(())
}

#[tokio::test]
async fn prefix_filter_restricts_the_index() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    make_test_data(
        &store,
        SRC,
        [
            TestObject::new("keep/one.bin", 10),
            TestObject::new("keep/two.bin", 20),
            TestObject::new("drop/three.bin", 30),
        ],
    );

    let config = Config {
        prefix_filter: Some("keep/".into()),
        ..base_config(work_dir.path())
    };
    let metrics = run_pipeline(config, &store).await?;

    let mut logged = upload_log(work_dir.path());
    logged.sort();
    assert_eq!(logged, vec!["keep/one.bin", "keep/two.bin"]);
    assert_eq!(metrics.snapshot().total_files, 2);

    Ok(())
}

#[tokio::test]
async fn abort_future_cancels_the_run() -> Result<()> {
    logging::init();
    let work_dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryObjectStore::new());
    make_test_data(&store, SRC, [TestObject::new("a.txt", 10)]);

    // Hand the pipeline a pre-built engine instead of letting it load one in the background
    let config = base_config(work_dir.path());
    let engine = Arc::new(scantar::SignatureDb::load(
        &config.definitions,
        scantar::ScanLimits::default(),
    )?);
    let pipeline = Pipeline::with_engine(
        config,
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        engine,
    )?;

    // Abort immediately; the run must terminate with the abort error rather than hang
    let result = pipeline.run(std::future::ready(())).await;
    assert!(result.is_err());

    Ok(())
}
