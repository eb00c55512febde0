//! Separation listing (`samplesep_datasets.csv`) parsing
//!
//! The separation tool writes a `Name,Path` header followed by one row per
//! separated dataset. Paths carry a trailing separator.

use crate::error::ListingError;
use std::fs;
use std::path::Path;

/// One row of the separation listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Sample name
    pub name: String,
    /// Dataset path prefix
    pub path: String,
}

/// Read and parse a listing file
pub fn read_listing(path: &Path) -> Result<Vec<ListingEntry>, ListingError> {
    let contents = fs::read_to_string(path).map_err(|e| ListingError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    parse_listing(&contents)
}

/// Parse listing contents
///
/// The first line is the header and is skipped. Blank lines are ignored.
/// Each row is split on its first comma; both halves are trimmed.
pub fn parse_listing(contents: &str) -> Result<Vec<ListingEntry>, ListingError> {
    let mut entries = Vec::new();

    for (idx, line) in contents.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }

        let (name, path) = line.split_once(',').ok_or_else(|| ListingError::BadRow {
            line: idx + 1,
            content: line.to_string(),
        })?;

        let name = name.trim();
        let path = path.trim();

        if name.is_empty() || path.is_empty() {
            return Err(ListingError::BadRow {
                line: idx + 1,
                content: line.to_string(),
            });
        }

        entries.push(ListingEntry {
            name: name.to_string(),
            path: path.to_string(),
        });
    }

    Ok(entries)
}
