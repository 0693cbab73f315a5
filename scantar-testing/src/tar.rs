//! Helpers for cracking open the `.tgz` segments the pipeline produces.

use crate::Result;
use flate2::read::GzDecoder;
use std::path::Path;
use tempfile::TempDir;

/// Extract a gzipped tar archive into a fresh temp directory and return it for inspection.
pub fn extract_tgz(path: &Path) -> Result<TempDir> {
    let temp_dir = TempDir::new()?;

    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    // Unpack entry by entry so test failures name the file that tripped them
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();

        assert!(
            entry.unpack_in(temp_dir.path())?,
            "entry '{}' refused to unpack",
            entry_path.display()
        );
    }

    Ok(temp_dir)
}

/// List `(key, size, mode)` for every entry of a gzipped tar archive, in archive order.
pub fn list_tgz_entries(path: &Path) -> Result<Vec<(String, u64, u32)>> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        entries.push((
            entry.path()?.to_string_lossy().into_owned(),
            entry.size(),
            entry.header().mode()?,
        ));
    }

    Ok(entries)
}
