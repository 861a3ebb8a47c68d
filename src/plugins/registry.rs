//! Reader for registry hives.
//!
//! Every key yields one event carrying its path and last-written time. Keys
//! listed in the embedded important-keys file additionally dump their
//! values.

use std::path::Path;

use anyhow::{anyhow, Result};
use notatin::cell_key_node::CellKeyNode;
use notatin::cell_value::CellValue;
use notatin::parser::ParserIterator;
use notatin::parser_builder::ParserBuilder;

use crate::runtime::{ArtifactReader, Event, PluginContext};

pub(crate) const REGF_HEADER: &[u8] = b"regf";

const IMPORTANT_KEYS: &str = include_str!("data/RegistryToTimeline-important-keys.txt");

pub struct RegistryToTimeline {
    important_keys: Vec<String>,
}

impl RegistryToTimeline {
    pub fn new() -> Self {
        Self {
            important_keys: parse_important_keys(IMPORTANT_KEYS),
        }
    }

    fn is_important(&self, key_path: &str) -> bool {
        let normalized = key_path.to_lowercase();
        self.important_keys
            .iter()
            .any(|important| normalized.ends_with(important.as_str()))
    }
}

impl ArtifactReader for RegistryToTimeline {
    fn file_header(&self) -> Option<&[u8]> {
        Some(REGF_HEADER)
    }

    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let source = ctx.original_path(artifact);
        let parser = ParserBuilder::from_path(artifact.to_path_buf())
            .build()
            .map_err(|e| anyhow!("unable to open hive {}: {:?}", artifact.display(), e))?;

        for key in ParserIterator::new(&parser).iter() {
            let timestamp = key.last_key_written_date_and_time();
            ctx.add_event(Event {
                timestamp: Some(timestamp),
                source: source.clone(),
                description: key.path.clone(),
                ..Default::default()
            })?;

            if self.is_important(&key.path) {
                emit_key_values(ctx, &key, &source)?;
            }
        }
        Ok(())
    }
}

fn emit_key_values(ctx: &mut PluginContext<'_>, key: &CellKeyNode, source: &str) -> Result<()> {
    let timestamp = key.last_key_written_date_and_time();
    for value in key.value_iter() {
        let content = value.get_content().0;
        ctx.add_event(Event {
            timestamp: Some(timestamp),
            source: source.to_string(),
            description: format!(
                "KeyPath: {} - ValueName: {} - ValueType: {} - ValueData: {}",
                key.path,
                value.get_pretty_name(),
                value_type_name(&content),
                readable_value(&content)
            ),
            ..Default::default()
        })?;
    }
    Ok(())
}

fn parse_important_keys(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_lowercase)
        .collect()
}

pub(crate) fn value_type_name(value: &CellValue) -> &'static str {
    match value {
        CellValue::String(_) => "RegSZ",
        CellValue::MultiString(_) => "RegMultiSZ",
        CellValue::U32(_) | CellValue::I32(_) => "RegDWord",
        CellValue::U64(_) | CellValue::I64(_) => "RegQWord",
        CellValue::Binary(_) => "RegBin",
        CellValue::None => "RegNone",
        _ => "RegBin",
    }
}

pub(crate) fn readable_value(value: &CellValue) -> String {
    match value {
        CellValue::String(s) => s.clone(),
        CellValue::MultiString(parts) => parts.join("|"),
        CellValue::U32(n) => n.to_string(),
        CellValue::I32(n) => n.to_string(),
        CellValue::U64(n) => n.to_string(),
        CellValue::I64(n) => n.to_string(),
        CellValue::Binary(bytes) => bytes
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_important_keys_skips_comments() {
        let keys = parse_important_keys(
            "# a comment\n\nMicrosoft\\Windows\\CurrentVersion\\Run\n  Environment  \n",
        );
        assert_eq!(
            keys,
            vec![
                "microsoft\\windows\\currentversion\\run".to_string(),
                "environment".to_string()
            ]
        );
    }

    #[test]
    fn test_is_important_matches_suffix_case_insensitively() {
        let reader = RegistryToTimeline::new();
        assert!(reader.is_important(
            "HKEY_LOCAL_MACHINE\\Software\\Microsoft\\Windows\\CurrentVersion\\Run"
        ));
        assert!(reader.is_important(
            "\\CsiTool-CreateHive-{GUID}\\Software\\MICROSOFT\\Windows\\CurrentVersion\\RUN"
        ));
        assert!(!reader.is_important("\\Software\\SomethingElse"));
    }

    #[test]
    fn test_readable_value_rendering() {
        assert_eq!(
            readable_value(&CellValue::String("hello".to_string())),
            "hello"
        );
        assert_eq!(
            readable_value(&CellValue::MultiString(vec![
                "a".to_string(),
                "b".to_string()
            ])),
            "a|b"
        );
        assert_eq!(readable_value(&CellValue::U32(7)), "7");
        assert_eq!(
            readable_value(&CellValue::Binary(vec![0xde, 0xad])),
            "dead"
        );
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!(value_type_name(&CellValue::String(String::new())), "RegSZ");
        assert_eq!(value_type_name(&CellValue::U32(0)), "RegDWord");
        assert_eq!(value_type_name(&CellValue::Binary(Vec::new())), "RegBin");
    }
}
