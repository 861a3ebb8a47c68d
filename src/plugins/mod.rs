//! Artifact readers and the plugin registry.
//!
//! Each reader converts one artifact kind into events; everything else
//! (staging, chunking, merging) is shared scaffolding in the runtime. New
//! plugins are compile-time registrations: add the module, list its name in
//! [`PLUGIN_NAMES`] and wire the constructor in [`build_reader`]. Unknown
//! names surface as configuration errors.

mod amcache;
mod browsers_history;
mod event_logs;
mod firefox_history;
mod i30_info;
mod ntfs_info;
mod recycle_bin;
mod registry;
mod user_assist;
mod usn_info;

pub use amcache::AmCacheToTimeline;
pub use browsers_history::BrowsersHistoryToTimeline;
pub use event_logs::EventLogsToTimeline;
pub use firefox_history::FirefoxHistoryToTimeline;
pub use i30_info::I30InfoToTimeline;
pub use ntfs_info::NTFSInfoToTimeline;
pub use recycle_bin::RecycleBinToTimeline;
pub use registry::RegistryToTimeline;
pub use user_assist::UserAssistToTimeline;
pub use usn_info::USNInfoToTimeline;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::error;

use crate::runtime::{ArtifactReader, PluginContext};

/// Plugin names accepted in the configuration file.
pub const PLUGIN_NAMES: &[&str] = &[
    "AmCacheToTimeline",
    "BrowsersHistoryToTimeline",
    "EventLogsToTimeline",
    "FirefoxHistoryToTimeline",
    "I30InfoToTimeline",
    "NTFSInfoToTimeline",
    "RecycleBinToTimeline",
    "RegistryToTimeline",
    "USNInfoToTimeline",
    "UserAssistToTimeline",
];

pub fn is_registered(name: &str) -> bool {
    PLUGIN_NAMES.contains(&name)
}

/// Build the reader registered under `name`.
pub fn build_reader(name: &str) -> Option<Box<dyn ArtifactReader>> {
    match name {
        "AmCacheToTimeline" => Some(Box::new(AmCacheToTimeline::new())),
        "BrowsersHistoryToTimeline" => Some(Box::new(BrowsersHistoryToTimeline::new())),
        "EventLogsToTimeline" => Some(Box::new(EventLogsToTimeline::new())),
        "FirefoxHistoryToTimeline" => Some(Box::new(FirefoxHistoryToTimeline::new())),
        "I30InfoToTimeline" => Some(Box::new(I30InfoToTimeline::new())),
        "NTFSInfoToTimeline" => Some(Box::new(NTFSInfoToTimeline::new())),
        "RecycleBinToTimeline" => Some(Box::new(RecycleBinToTimeline::new())),
        "RegistryToTimeline" => Some(Box::new(RegistryToTimeline::new())),
        "USNInfoToTimeline" => Some(Box::new(USNInfoToTimeline::new())),
        "UserAssistToTimeline" => Some(Box::new(UserAssistToTimeline::new())),
        _ => None,
    }
}

/// Header-name to column-index lookup for the ORC CSV artifacts.
pub(crate) struct CsvRow<'a> {
    headers: &'a HashMap<String, usize>,
    record: &'a csv::StringRecord,
}

impl CsvRow<'_> {
    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|&idx| self.record.get(idx))
    }
}

/// Parse a CSV artifact row by row, with the cleaned-retry path.
///
/// ORC CSV exports occasionally carry NUL bytes or broken encodings. A
/// clean file is parsed directly; a contaminated one triggers a rollback of
/// the current artifact and a second parse over the content with all
/// non-printable bytes stripped.
pub(crate) fn parse_csv_with_recovery<F>(
    ctx: &mut PluginContext<'_>,
    artifact: &Path,
    mut handle_row: F,
) -> Result<()>
where
    F: FnMut(&mut PluginContext<'_>, &CsvRow<'_>) -> Result<()>,
{
    let raw = fs::read(artifact)
        .with_context(|| format!("unable to read {}", artifact.display()))?;

    let contaminated = raw.contains(&0) || std::str::from_utf8(&raw).is_err();
    if !contaminated {
        return parse_csv_content(ctx, &raw, &mut handle_row);
    }

    error!(
        "csv error caught alternative way for host {}: {}",
        ctx.hostname(),
        artifact.display()
    );
    ctx.rollback()?;
    let cleaned = strip_non_printable(&raw);
    parse_csv_content(ctx, cleaned.as_bytes(), &mut handle_row)
}

fn parse_csv_content<F>(ctx: &mut PluginContext<'_>, content: &[u8], handle_row: &mut F) -> Result<()>
where
    F: FnMut(&mut PluginContext<'_>, &CsvRow<'_>) -> Result<()>,
{
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content);
    let headers: HashMap<String, usize> = reader
        .headers()
        .context("unable to read csv header")?
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.to_string(), idx))
        .collect();

    for record in reader.records() {
        let record = record.context("malformed csv record")?;
        let row = CsvRow {
            headers: &headers,
            record: &record,
        };
        handle_row(ctx, &row)?;
    }
    Ok(())
}

/// Keep ASCII printable characters plus the usual whitespace.
fn strip_non_printable(data: &[u8]) -> String {
    data.iter()
        .filter(|b| matches!(b, 0x20..=0x7e | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c))
        .map(|&b| b as char)
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::path::Path;

    use crate::runtime::{ArtifactReader, ChunkWriter, PluginContext};

    /// Drive one reader over one artifact and return the surviving rows.
    pub(crate) fn run_reader(
        reader: &mut dyn ArtifactReader,
        artifact: &Path,
        temp_dir: &Path,
        originals: HashMap<String, String>,
    ) -> Vec<String> {
        let mut writer = ChunkWriter::new(temp_dir, "HOST", "TestPlugin", "Test");
        writer.artifact_boundary().unwrap();
        {
            let mut ctx = PluginContext::for_tests(&mut writer, &originals, temp_dir);
            reader.parse_artifact(&mut ctx, artifact).unwrap();
        }
        writer.artifact_boundary().unwrap();
        let mut lines = Vec::new();
        for path in writer.run_file_paths() {
            let content = std::fs::read_to_string(&path).unwrap();
            lines.extend(content.lines().map(str::to_string));
        }
        writer.finish().unwrap();
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_registered_name_builds() {
        for name in PLUGIN_NAMES {
            assert!(is_registered(name));
            assert!(build_reader(name).is_some(), "{name} did not build");
        }
        assert!(!is_registered("NopeToTimeline"));
        assert!(build_reader("NopeToTimeline").is_none());
    }

    #[test]
    fn test_strip_non_printable() {
        let dirty = b"US\x00N,Time\xffStamp\nrow,1\n";
        assert_eq!(strip_non_printable(dirty), "USN,TimeStamp\nrow,1\n");
    }
}
