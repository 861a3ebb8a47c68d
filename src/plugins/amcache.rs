//! Reader for AmCache hives.
//!
//! AmCache stores application, driver and file inventories as registry
//! subtrees. Beyond the key last-written events, several values carry their
//! own timestamps (compilation dates, FILETIME modification and creation
//! times, install epochs) and each becomes an extra event.

use std::path::Path;

use anyhow::{anyhow, Result};
use notatin::cell_key_node::CellKeyNode;
use notatin::cell_value::CellValue;
use notatin::parser::ParserIterator;
use notatin::parser_builder::ParserBuilder;

use super::registry::REGF_HEADER;
use crate::runtime::{event, ArtifactReader, Event, PluginContext};

pub struct AmCacheToTimeline;

impl AmCacheToTimeline {
    pub fn new() -> Self {
        Self
    }
}

impl ArtifactReader for AmCacheToTimeline {
    fn file_header(&self) -> Option<&[u8]> {
        Some(REGF_HEADER)
    }

    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let source = ctx.original_path(artifact);
        let parser = ParserBuilder::from_path(artifact.to_path_buf())
            .build()
            .map_err(|e| anyhow!("unable to open hive {}: {:?}", artifact.display(), e))?;

        for key in ParserIterator::new(&parser).iter() {
            if segments_below(&key.path, "\\Root\\InventoryApplicationFile\\") >= 1 {
                inventory_application_file(ctx, &key, &source)?;
            } else if segments_below(&key.path, "\\Root\\InventoryDriverBinary\\") >= 1 {
                inventory_driver_binary(ctx, &key, &source)?;
            } else if segments_below(&key.path, "\\Root\\File\\") >= 2 {
                file_entry(ctx, &key, &source)?;
            } else if segments_below(&key.path, "\\Root\\Programs\\") >= 1 {
                programs_entry(ctx, &key, &source)?;
            }
        }
        Ok(())
    }
}

/// Number of path segments below the given subtree marker, or 0 when the
/// key is outside the subtree.
fn segments_below(key_path: &str, marker: &str) -> usize {
    match key_path.find(marker) {
        Some(idx) => key_path[idx + marker.len()..]
            .split('\\')
            .filter(|s| !s.is_empty())
            .count(),
        None => 0,
    }
}

fn inventory_application_file(
    ctx: &mut PluginContext<'_>,
    key: &CellKeyNode,
    source: &str,
) -> Result<()> {
    let mut desc = vec![format!("KeyPath: {}", key.path)];
    if let Some(name) = string_value(key, "Name") {
        desc.push(format!("Name: {name}"));
    }
    if let Some(path) = string_value(key, "LowerCaseLongPath") {
        desc.push(format!("ExecPath: {path}"));
    }
    if let Some(file_id) = string_value(key, "FileId") {
        desc.push(format!("SHA1: {}", strip_file_id_prefix(&file_id)));
    }
    if let Some(size) = value_as_string(key, "Size") {
        desc.push(format!("FileSize: {size}"));
    }
    let desc = desc.join(" - ");

    ctx.add_event(Event {
        timestamp: Some(key.last_key_written_date_and_time()),
        source: source.to_string(),
        description: format!("Key last modified timestamp - {desc}"),
        ..Default::default()
    })?;

    if let Some(link_date) = string_value(key, "LinkDate") {
        if let Some(timestamp) = event::from_us_datetime(&link_date) {
            ctx.add_event(Event {
                timestamp: Some(timestamp),
                source: source.to_string(),
                description: format!("Compilation timestamp - {desc}"),
                ..Default::default()
            })?;
        }
    }
    Ok(())
}

fn inventory_driver_binary(
    ctx: &mut PluginContext<'_>,
    key: &CellKeyNode,
    source: &str,
) -> Result<()> {
    let mut desc = vec![format!("KeyPath: {}", key.path)];
    if let Some(name) = string_value(key, "DriverName") {
        desc.push(format!("Name: {name}"));
    }
    if let Some(path) = string_value(key, "LowerCaseLongPath") {
        desc.push(format!("DriverPath: {path}"));
    }
    // The sha1 lives either in a value or in the key name itself.
    if let Some(driver_id) = string_value(key, "DriverId") {
        desc.push(format!("SHA1: {}", strip_file_id_prefix(&driver_id)));
    } else {
        let key_name = key.path.rsplit('\\').next().unwrap_or("");
        if let Some(sha1) = key_name.strip_prefix("0000") {
            desc.push(format!("SHA1: {sha1}"));
        }
    }
    if let Some(size) = value_as_string(key, "ImageSize") {
        desc.push(format!("FileSize: {size}"));
    }
    let desc = desc.join(" - ");

    ctx.add_event(Event {
        timestamp: Some(key.last_key_written_date_and_time()),
        source: source.to_string(),
        description: format!("Key last modified timestamp - {desc}"),
        ..Default::default()
    })?;

    if let Some(write_time) = string_value(key, "DriverLastWriteTime") {
        if let Some(timestamp) = event::from_us_datetime(&write_time) {
            ctx.add_event(Event {
                timestamp: Some(timestamp),
                source: source.to_string(),
                description: format!("Driver Last Write time - {desc}"),
                ..Default::default()
            })?;
        }
    }
    Ok(())
}

/// Entries under Root\File\{volume-guid}\{entry} use numeric value names:
/// 15 = path, 101 = file id, 6 = size, 17/12 = FILETIME stamps, f = unix
/// compilation time.
fn file_entry(ctx: &mut PluginContext<'_>, key: &CellKeyNode, source: &str) -> Result<()> {
    let mut desc = vec![format!("KeyPath: {}", key.path)];
    if let Some(path) = string_value(key, "15") {
        desc.push(format!("ExecPath: {path}"));
    }
    if let Some(file_id) = string_value(key, "101") {
        desc.push(format!("SHA1: {}", strip_file_id_prefix(&file_id)));
    }
    if let Some(size) = value_as_string(key, "6") {
        desc.push(format!("FileSize: {size}"));
    }
    let desc = desc.join(" - ");

    ctx.add_event(Event {
        timestamp: Some(key.last_key_written_date_and_time()),
        source: source.to_string(),
        description: format!("Key last modified timestamp - {desc}"),
        ..Default::default()
    })?;

    let stamped = [
        ("17", "Modification time"),
        ("12", "Creation time"),
    ];
    for (value_name, label) in stamped {
        if let Some(filetime) = value_as_u64(key, value_name) {
            if let Some(timestamp) = event::from_filetime(filetime as i64) {
                ctx.add_event(Event {
                    timestamp: Some(timestamp),
                    source: source.to_string(),
                    description: format!("{label} - {desc}"),
                    ..Default::default()
                })?;
            }
        }
    }

    if let Some(epoch_seconds) = value_as_u64(key, "f") {
        if let Some(timestamp) = event::from_unix_seconds(epoch_seconds as i64) {
            ctx.add_event(Event {
                timestamp: Some(timestamp),
                source: source.to_string(),
                description: format!("Compilation time - {desc}"),
                ..Default::default()
            })?;
        }
    }
    Ok(())
}

/// Entries under Root\Programs\{id}: 0 = name, 1 = version, 2 = publisher,
/// a = install epoch, b = uninstall epoch.
fn programs_entry(ctx: &mut PluginContext<'_>, key: &CellKeyNode, source: &str) -> Result<()> {
    let mut desc = vec![format!("KeyPath: {}", key.path)];
    if let Some(name) = string_value(key, "0") {
        desc.push(format!("Name: {name}"));
    }
    if let Some(version) = string_value(key, "1") {
        desc.push(format!("Version: {version}"));
    }
    if let Some(publisher) = string_value(key, "2") {
        desc.push(format!("Publisher: {publisher}"));
    }
    let desc = desc.join(" - ");

    ctx.add_event(Event {
        timestamp: Some(key.last_key_written_date_and_time()),
        source: source.to_string(),
        description: format!("Key last modified timestamp - {desc}"),
        ..Default::default()
    })?;

    if let Some(install) = value_as_u64(key, "a") {
        if let Some(timestamp) = event::from_unix_seconds(install as i64) {
            ctx.add_event(Event {
                timestamp: Some(timestamp),
                source: source.to_string(),
                description: format!("Installation time - {desc}"),
                ..Default::default()
            })?;
        }
    }
    if let Some(uninstall) = value_as_u64(key, "b") {
        if uninstall != 0 {
            if let Some(timestamp) = event::from_unix_seconds(uninstall as i64) {
                ctx.add_event(Event {
                    timestamp: Some(timestamp),
                    source: source.to_string(),
                    description: format!("Uninstallation time - {desc}"),
                    ..Default::default()
                })?;
            }
        }
    }
    Ok(())
}

fn content_of(key: &CellKeyNode, value_name: &str) -> Option<CellValue> {
    key.value_iter()
        .find(|value| value.get_pretty_name() == value_name)
        .map(|value| value.get_content().0)
}

fn string_value(key: &CellKeyNode, value_name: &str) -> Option<String> {
    match content_of(key, value_name)? {
        CellValue::String(s) => Some(s),
        _ => None,
    }
}

fn value_as_string(key: &CellKeyNode, value_name: &str) -> Option<String> {
    match content_of(key, value_name)? {
        CellValue::String(s) => Some(s),
        CellValue::U32(n) => Some(n.to_string()),
        CellValue::I32(n) => Some(n.to_string()),
        CellValue::U64(n) => Some(n.to_string()),
        CellValue::I64(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_u64(key: &CellKeyNode, value_name: &str) -> Option<u64> {
    match content_of(key, value_name)? {
        CellValue::U32(n) => Some(n as u64),
        CellValue::I32(n) => u64::try_from(n).ok(),
        CellValue::U64(n) => Some(n),
        CellValue::I64(n) => u64::try_from(n).ok(),
        CellValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn strip_file_id_prefix(file_id: &str) -> &str {
    // FileId values are "0000" + sha1.
    file_id.get(4..).unwrap_or(file_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_below() {
        assert_eq!(
            segments_below(
                "\\Root\\InventoryApplicationFile\\app.exe|abc",
                "\\Root\\InventoryApplicationFile\\"
            ),
            1
        );
        assert_eq!(
            segments_below("\\Root\\File\\{guid}\\1234", "\\Root\\File\\"),
            2
        );
        assert_eq!(
            segments_below("\\Root\\File\\{guid}", "\\Root\\File\\"),
            1
        );
        assert_eq!(segments_below("\\Root\\Other\\x", "\\Root\\File\\"), 0);
    }

    #[test]
    fn test_strip_file_id_prefix() {
        assert_eq!(
            strip_file_id_prefix("0000deadbeefdeadbeefdeadbeefdeadbeefdead"),
            "deadbeefdeadbeefdeadbeefdeadbeefdead"
        );
        assert_eq!(strip_file_id_prefix("abc"), "abc");
    }
}
