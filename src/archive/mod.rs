//! Archive module - 7z member extraction for ORC collections
//!
//! ORC archives nest 7z inside 7z; this module extracts selected members
//! (by predicate) into a destination directory, never following symlinks and
//! never writing outside the destination. Members whose basename would not
//! fit the file system name limit are re-extracted in a safe mode that keeps
//! the tail of the name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use sevenz_rust2::{default_entry_extract_fn, ArchiveReader, Password};
use tracing::debug;

/// Longest member basename extracted as-is; longer names are truncated to
/// their trailing 254 bytes.
pub const MAX_FILE_NAME_LENGTH: usize = 255;

/// Name of the manifest mapping staged members to their original paths.
pub const GETTHIS_MANIFEST: &str = "GetThis.csv";

/// Extract every member whose path matches `pattern` into `dest`.
pub fn extract_matching(archive: &Path, dest: &Path, pattern: &Regex) -> Result<()> {
    extract_filtered(archive, dest, |name| pattern.is_match(name))
}

/// Extract the single named member, typically a nested 7z sub-archive.
pub fn extract_nested(archive: &Path, dest: &Path, inner_name: &str) -> Result<()> {
    extract_filtered(archive, dest, |name| name == inner_name)
}

/// Extract the GetThis manifest if the archive carries one.
pub fn extract_getthis(archive: &Path, dest: &Path) -> Result<()> {
    extract_filtered(archive, dest, |name| name == GETTHIS_MANIFEST)
}

/// Extract members selected by `filter` into `dest`, preserving directory
/// structure. Falls back to safe mode when the file system rejects a member
/// name.
pub fn extract_filtered<F>(archive: &Path, dest: &Path, filter: F) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    match try_extract(archive, dest, &filter, false) {
        Err(e) if is_name_too_long(&e) => {
            debug!(
                "retrying extraction of {} in safe mode: {:#}",
                archive.display(),
                e
            );
            try_extract(archive, dest, &filter, true)
        }
        other => other,
    }
}

fn try_extract<F>(archive: &Path, dest: &Path, filter: &F, safe_mode: bool) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    let mut reader = ArchiveReader::open(archive, Password::empty())
        .map_err(|e| anyhow!("unable to open {}: {}", archive.display(), e))?;

    reader
        .for_each_entries(|entry, data| {
            if entry.is_directory() || !filter(entry.name()) {
                return Ok(true);
            }
            let Some(mut rel) = sanitize_member_path(entry.name()) else {
                return Ok(true);
            };
            if safe_mode {
                rel = shorten_long_basename(&rel);
            }
            let target = dest.join(rel);
            default_entry_extract_fn(entry, data, &target)?;
            Ok(true)
        })
        .map_err(|e| anyhow!("extraction of {} failed: {}", archive.display(), e))?;

    Ok(())
}

/// Member paths come straight from the archive: normalize separators and
/// refuse anything that would escape the destination.
fn sanitize_member_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let mut clean = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part => clean.push(part),
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Keep the final `MAX_FILE_NAME_LENGTH - 1` bytes of an over-long basename,
/// starting on a char boundary.
fn shorten_long_basename(rel: &Path) -> PathBuf {
    let Some(name) = rel.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return rel.to_path_buf();
    };
    if name.len() < MAX_FILE_NAME_LENGTH {
        return rel.to_path_buf();
    }
    let mut start = name.len() - (MAX_FILE_NAME_LENGTH - 1);
    while !name.is_char_boundary(start) {
        start += 1;
    }
    rel.with_file_name(&name[start..])
}

fn is_name_too_long(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let msg = cause.to_string();
        msg.contains("File name too long") || msg.contains("Invalid argument")
    })
}

/// Ingest a GetThis manifest into the staged-name to original-path map.
///
/// Column 5 holds the staged member path, column 4 the original on-disk path
/// at collection time; the map is keyed by the staged basename.
pub fn parse_getthis(path: &Path, map: &mut HashMap<String, String>) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("unable to read manifest {}", path.display()))?;

    for record in reader.records() {
        let record = record.context("malformed manifest record")?;
        let (Some(original), Some(staged)) = (record.get(4), record.get(5)) else {
            continue;
        };
        let staged = staged.replace('\\', "/");
        let basename = staged.rsplit('/').next().unwrap_or(&staged);
        if !basename.is_empty() {
            map.insert(basename.to_string(), original.to_string());
        }
    }

    Ok(())
}
