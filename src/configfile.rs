//! Atomic block append/removal in shared config files.
//!
//! The exporter and quotaer both maintain append-only text files whose
//! entries must be added and removed without ever leaving a torn file
//! behind. Rewrites go through a temp file in the same directory followed
//! by a rename; callers serialize access with their own mutex.

use std::fs;
use std::io::Write;
use std::path::Path;

use regex::Regex;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{Error, Result};

/// Read a config file, treating a missing file as empty.
pub(crate) fn read_config(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Replace the contents of `path` atomically.
pub(crate) fn rewrite_config(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Append `block` to the config file, inserting a newline first when the
/// existing contents don't end with one.
pub(crate) fn append_block(path: &Path, block: &str) -> Result<()> {
    let mut contents = read_config(path)?;
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(block);
    rewrite_config(path, &contents)
}

/// Remove the exact text `block` from the config file. A block that is not
/// present is not an error: delete retries must converge.
pub(crate) fn remove_block(path: &Path, block: &str, id: u32) -> Result<()> {
    let contents = read_config(path)?;
    match strip_block(&contents, block) {
        Some(updated) => rewrite_config(path, &updated),
        None => {
            warn!(id, config = %path.display(), "block not found in config, nothing to remove");
            Ok(())
        }
    }
}

/// Remove the first occurrence of `block` from `contents`, or `None` when it
/// does not appear.
pub(crate) fn strip_block(contents: &str, block: &str) -> Option<String> {
    contents.find(block).map(|idx| {
        let mut out = String::with_capacity(contents.len() - block.len());
        out.push_str(&contents[..idx]);
        out.push_str(&contents[idx + block.len()..]);
        out
    })
}

/// Scan config text with a single-capture-group regex and return the largest
/// id it matches.
pub(crate) fn max_config_id(contents: &str, pattern: &Regex) -> Option<u32> {
    pattern
        .captures_iter(contents)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().parse::<u32>().ok())
        .max()
}
