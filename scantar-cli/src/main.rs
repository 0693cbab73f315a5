//! Environment-driven front end for the scantar pipeline.
//!
//! Every knob is an environment variable; each one echoes its resolved value at startup so a run
//! log always records the configuration it ran with.  Exit code is zero only on a clean,
//! complete run.

mod progress;

use scantar::{Config, ObjectStore, Pipeline, S3Store};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Resolve an environment variable, echoing `NAME="value" # usage` either way.
fn env_value(name: &str, default: &str, usage: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => {
            println!("  {:<34} # {usage}", format!("{name}={value:?}"));
            value
        }
        _ => {
            println!("  {:<34} # {usage}", format!("{name}={default:?} (default)"));
            default.to_string()
        }
    }
}

/// A variable that acts as a switch: set and non-empty means on.
fn env_flag(name: &str, usage: &str) -> bool {
    !env_value(name, "", usage).is_empty()
}

fn env_usize(name: &str, default: usize, usage: &str) -> Result<usize, String> {
    let value = env_value(name, &default.to_string(), usage);
    value
        .trim()
        .parse()
        .map_err(|_| format!("invalid integer for {name}: {value:?}"))
}

fn load_config() -> Result<Config, String> {
    println!("Configuration:");

    let src_bucket = env_value("SRC_BUCKET", "", "The source bucket name");
    let dst_bucket = env_value("DST_BUCKET", "", "The destination bucket name");

    let size_cap = scantar::parse_byte_size(&env_value(
        "SIZECAP",
        "2G",
        "Uncompressed payload cap per archive segment",
    ))
    .map_err(|e| format!("failed to parse SIZECAP: {e}"))?;

    let archive_name = env_value(
        "ARCHIVE_NAME",
        "archive_%07d.tgz",
        "Segment name template with one integer slot",
    );

    let definitions = env_value("DEFINITIONS", "./db", "The path with the signature definitions");
    let disable_scanner = env_flag("DISABLE_SCANNER", "Bypass the scanner stage entirely");
    let scan_concurrency = env_usize(
        "CONCURRENT_SCANNERS",
        3,
        "How many concurrent scanners can run at once",
    )?;
    let download_concurrency = env_usize(
        "CONCURRENT_DOWNLOADS",
        16,
        "How many concurrent downloads can run at once",
    )?;
    let upload_concurrency = env_usize(
        "CONCURRENT_UPLOADS",
        2,
        "How many concurrent segment uploads can run at once",
    )?;

    let max_in_mem_kib = env_usize(
        "MAX_IN_MEM",
        96,
        "Largest object (KiB) held in memory instead of spilling to disk",
    )?;

    let refresh_interval = scantar::parse_duration(&env_value(
        "REFRESH",
        "20m",
        "The refresh interval for the signing credentials",
    ))
    .map_err(|e| format!("failed to parse REFRESH: {e}"))?;

    let prefix_filter = env_value("PREFIX_FILTER", "", "Bucket prefix selector");
    let prefix_delimiter = env_flag("PREFIX_DELIM", "Use '/' as the listing delimiter");
    let subset = env_value("SUBSET", "", "Subset the files by START:STRIDE or START:STRIDE:END");

    let chan_to_download = env_usize("CHAN_TODO_DOWNLOAD", 10, "Download queue depth")?;
    let chan_downloaded = env_usize("CHAN_DOWNLOADED_FILES", 20, "Downloaded-file queue depth")?;
    let chan_scanned = env_usize("CHAN_SCANNED_FILES", 10, "Scanned-file queue depth")?;
    let chan_archive = env_usize("CHAN_ARCHIVE_FILES", 2, "Archive queue depth")?;

    let s3_endpoint = env_value("S3_ENDPOINT", "", "Custom S3-compatible endpoint URL");
    let s3_endpoint = if s3_endpoint.is_empty() {
        None
    } else {
        Some(
            s3_endpoint
                .parse()
                .map_err(|e| format!("invalid S3_ENDPOINT: {e}"))?,
        )
    };

    Ok(Config {
        src_bucket,
        dst_bucket,
        size_cap,
        archive_name,
        definitions: definitions.into(),
        disable_scanner,
        scan_concurrency,
        download_concurrency,
        upload_concurrency,
        max_in_mem: max_in_mem_kib as u64 * 1024,
        refresh_interval,
        prefix_filter: (!prefix_filter.is_empty()).then_some(prefix_filter),
        prefix_delimiter,
        subset: (!subset.is_empty()).then_some(subset),
        chan_to_download,
        chan_downloaded,
        chan_scanned,
        chan_archive,
        s3_endpoint,
        ..Config::default()
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let debug = env_flag("DEBUG", "Verbose logging");

    // With the status line active, routine logs would shred it; they only open up under DEBUG
    let filter = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let store: Arc<dyn ObjectStore> = match S3Store::connect(&config).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("could not initialize the object store client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = match Pipeline::new(config, store) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let reporter = progress::spawn(pipeline.metrics(), debug);

    let result = pipeline
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    let summary = reporter.finish().await;

    match result {
        Ok(()) => {
            info!("run complete");
            println!(
                "Done: {} objects in {} segments ({} uploaded)",
                summary.uploaded_archived_files,
                summary.uploaded_files,
                scantar::humanize_bytes(summary.uploaded_bytes),
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("scantar: {e}");
            ExitCode::FAILURE
        }
    }
}
