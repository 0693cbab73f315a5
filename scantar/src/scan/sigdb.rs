//! Signature-database scan engine.
//!
//! Definitions are plain text files in the definitions directory, one signature per line in the
//! form `NAME:HEXBYTES` (comment lines start with `#`).  All signatures are compiled into a
//! single Aho-Corasick automaton, so scan cost stays flat as the database grows.  Scans run over
//! fixed windows with an overlap of the longest signature so a match spanning a window boundary
//! is still seen, and the wall-clock budget is checked between windows.

use super::{ScanEngine, ScanLimits, ScanMetadata, ScanOutcome};
use crate::{error, Result};
use aho_corasick::AhoCorasick;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::io::Read;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

const SCAN_WINDOW: usize = 1024 * 1024;

pub struct SignatureDb {
    automaton: AhoCorasick,
    names: Vec<String>,
    /// Longest signature length, minus one; windows overlap by this much.
    overlap: usize,
    limits: ScanLimits,
    metadata: ScanMetadata,
}

impl SignatureDb {
    /// Load every definition file in `dir` and compile the engine.
    pub fn load(dir: &Path, limits: ScanLimits) -> Result<Self> {
        let mut names = Vec::new();
        let mut patterns: Vec<Vec<u8>> = Vec::new();
        let mut newest: Option<DateTime<Utc>> = None;

        let entries = std::fs::read_dir(dir).context(error::DefinitionsPathSnafu { path: dir })?;
        for entry in entries {
            let entry = entry.context(error::DefinitionsPathSnafu { path: dir })?;
            let path = entry.path();
            if !entry
                .file_type()
                .context(error::DefinitionsPathSnafu { path: dir })?
                .is_file()
            {
                continue;
            }

            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                let modified: DateTime<Utc> = modified.into();
                newest = Some(newest.map_or(modified, |cur| cur.max(modified)));
            }

            let text =
                std::fs::read_to_string(&path).context(error::DefinitionsPathSnafu { path: dir })?;
            for (idx, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                let (name, hex) = line.split_once(':').context(error::MalformedSignatureSnafu {
                    path: &path,
                    line: idx + 1,
                })?;
                let bytes = decode_hex(hex).context(error::MalformedSignatureSnafu {
                    path: &path,
                    line: idx + 1,
                })?;
                ensure!(
                    !name.is_empty() && !bytes.is_empty(),
                    error::MalformedSignatureSnafu {
                        path: &path,
                        line: idx + 1,
                    }
                );

                names.push(name.to_string());
                patterns.push(bytes);
            }

            debug!(path = %path.display(), "loaded definition file");
        }

        ensure!(!names.is_empty(), error::EmptySignatureDbSnafu { path: dir });

        let overlap = patterns.iter().map(Vec::len).max().unwrap_or(1) - 1;
        let automaton = AhoCorasick::new(&patterns)
            .ok()
            .context(error::EmptySignatureDbSnafu { path: dir })?;

        let signature_date = newest.unwrap_or_else(Utc::now).to_rfc3339();
        info!(
            signatures = names.len(),
            signature_date = %signature_date,
            max_scan_size = limits.max_scan_size,
            max_scan_time_ms = limits.max_scan_time.as_millis() as u64,
            max_file_size = limits.max_file_size,
            "signature database compiled"
        );

        Ok(Self {
            automaton,
            metadata: ScanMetadata {
                vendor: "scantar sigdb".to_string(),
                version: names.len().to_string(),
                signature_date,
            },
            names,
            overlap,
            limits,
        })
    }

    pub fn signature_count(&self) -> usize {
        self.names.len()
    }

    /// Scan `data` window by window, honoring the wall-clock budget.
    fn scan_slice(&self, data: &[u8], started: Instant) -> Result<Option<&str>, String> {
        let mut window_start = 0usize;

        while window_start < data.len() {
            if started.elapsed() > self.limits.max_scan_time {
                return Err("scan time limit exceeded".to_string());
            }

            let window_end = (window_start + SCAN_WINDOW + self.overlap).min(data.len());
            if let Some(found) = self.automaton.find(&data[window_start..window_end]) {
                return Ok(Some(&self.names[found.pattern().as_usize()]));
            }

            window_start += SCAN_WINDOW;
        }

        Ok(None)
    }
}

impl ScanEngine for SignatureDb {
    fn scan_buffer(&self, data: &[u8], name: &str) -> ScanOutcome {
        if data.len() as u64 > self.limits.max_file_size.min(self.limits.max_scan_size) {
            return ScanOutcome::Failed {
                message: format!("{name} exceeds the maximum scannable size"),
            };
        }

        match self.scan_slice(data, Instant::now()) {
            Ok(Some(virus)) => ScanOutcome::Infected {
                virus: virus.to_string(),
            },
            Ok(None) => ScanOutcome::Clean,
            Err(message) => ScanOutcome::Failed { message },
        }
    }

    fn scan_path(&self, path: &Path, name: &str) -> ScanOutcome {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                return ScanOutcome::Failed {
                    message: format!("could not open {name} for scanning: {e}"),
                }
            }
        };

        if let Ok(meta) = file.metadata() {
            if meta.len() > self.limits.max_file_size.min(self.limits.max_scan_size) {
                return ScanOutcome::Failed {
                    message: format!("{name} exceeds the maximum scannable size"),
                };
            }
        }

        let started = Instant::now();
        let mut reader = std::io::BufReader::new(file);
        // Carry the tail of the previous chunk so a signature spanning the boundary still matches
        let mut chunk = vec![0u8; SCAN_WINDOW + self.overlap];
        let mut carried = 0usize;

        loop {
            if started.elapsed() > self.limits.max_scan_time {
                return ScanOutcome::Failed {
                    message: "scan time limit exceeded".to_string(),
                };
            }

            let mut filled = carried;
            while filled < chunk.len() {
                match reader.read(&mut chunk[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        return ScanOutcome::Failed {
                            message: format!("error reading {name}: {e}"),
                        }
                    }
                }
            }

            if filled == 0 {
                return ScanOutcome::Clean;
            }

            if let Some(found) = self.automaton.find(&chunk[..filled]) {
                return ScanOutcome::Infected {
                    virus: self.names[found.pattern().as_usize()].clone(),
                };
            }

            if filled < chunk.len() {
                // Short fill means EOF
                return ScanOutcome::Clean;
            }

            carried = self.overlap.min(filled);
            chunk.copy_within(filled - carried..filled, 0);
        }
    }

    fn metadata(&self) -> &ScanMetadata {
        &self.metadata
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    let hex = hex.trim();
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
