//! Reader for UserAssist registry keys.
//!
//! UserAssist tracks GUI program executions under
//! `...\Explorer\UserAssist\{GUID}\Count`. Value names are ROT13-encoded
//! paths, often prefixed with a known-folder GUID; value data carries run
//! count, focus time and the FILETIME of the last run.

use std::path::Path;

use anyhow::{anyhow, Result};
use notatin::cell_key_node::CellKeyNode;
use notatin::cell_value::CellValue;
use notatin::parser::ParserIterator;
use notatin::parser_builder::ParserBuilder;

use super::registry::REGF_HEADER;
use crate::runtime::{event, ArtifactReader, Event, PluginContext};

const KNOWN_FOLDERS: [(&str, &str); 8] = [
    ("{1AC14E77-02E7-4E5D-B744-2EB1AE5198B7}", "C:\\Windows\\System32"),
    ("{6D809377-6AF0-444B-8957-A3773F02200E}", "C:\\Program Files"),
    ("{7C5A40EF-A0FB-4BFC-874A-C0F2E0B9FA8E}", "C:\\Program Files (x86)"),
    ("{F38BF404-1D43-42F2-9305-67DE0B28FC23}", "C:\\Windows"),
    (
        "{0139D44E-6AFE-49F2-8690-3DAFCAE6FFB8}",
        "C:\\ProgramData\\Microsoft\\Windows \\Start Menu\\Programs",
    ),
    (
        "{9E3995AB-1F9C-4F13-B827-48B24B6C7174}",
        "%AppData%\\Roaming\\Microsoft\\Internet Explorer\\Quick Launch\\User Pinned",
    ),
    (
        "{A77F5D77-2E2B-44C3-A6A2-ABA601054A51}",
        "%AppData%\\Roaming\\Microsoft\\Windows \\Start Menu\\Programs",
    ),
    ("{D65231B0-B2F1-4857-A4CE-A8E7C6EA7D27}", "C:\\Windows\\SysWOW64"),
];

// Value layouts: Windows 7+ entries are 72 bytes, XP/Vista entries 16.
const ENTRY_LEN_RECENT: usize = 72;
const ENTRY_LEN_LEGACY: usize = 16;

pub struct UserAssistToTimeline;

impl UserAssistToTimeline {
    pub fn new() -> Self {
        Self
    }
}

impl ArtifactReader for UserAssistToTimeline {
    fn file_header(&self) -> Option<&[u8]> {
        Some(REGF_HEADER)
    }

    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let source = ctx.original_path(artifact);
        let parser = ParserBuilder::from_path(artifact.to_path_buf())
            .build()
            .map_err(|e| anyhow!("unable to open hive {}: {:?}", artifact.display(), e))?;

        for key in ParserIterator::new(&parser).iter() {
            if key.path.contains("\\Explorer\\UserAssist\\") && key.path.ends_with("\\Count") {
                parse_count_key(ctx, &key, &source)?;
            }
        }
        Ok(())
    }
}

fn parse_count_key(ctx: &mut PluginContext<'_>, key: &CellKeyNode, source: &str) -> Result<()> {
    let reg_time = event::format_timestamp(&key.last_key_written_date_and_time());

    for value in key.value_iter() {
        let exec_path = expand_known_folder(&rot13(&value.get_pretty_name()));
        if exec_path.starts_with("UEME_CTL") {
            continue;
        }
        let CellValue::Binary(data) = value.get_content().0 else {
            continue;
        };

        match data.len() {
            ENTRY_LEN_RECENT => {
                let run_count = read_u32(&data, 4);
                let focus_time = read_u32(&data, 12);
                let Some(last_run) = last_run_time(&data, 60) else {
                    continue;
                };
                ctx.add_event(Event {
                    timestamp: Some(last_run),
                    source: source.to_string(),
                    description: format!(
                        "ExecPath: {exec_path} - RunCount: {run_count} - \
                         FocusTime: {focus_time} - RegistryTimestamp: {reg_time}"
                    ),
                    ..Default::default()
                })?;
            }
            ENTRY_LEN_LEGACY => {
                let run_count = read_u32(&data, 4).wrapping_sub(5);
                let Some(last_run) = last_run_time(&data, 8) else {
                    continue;
                };
                ctx.add_event(Event {
                    timestamp: Some(last_run),
                    source: source.to_string(),
                    description: format!(
                        "ExecPath: {exec_path} - RunCount: {run_count} - \
                         RegistryTimestamp: {reg_time}"
                    ),
                    ..Default::default()
                })?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn last_run_time(data: &[u8], offset: usize) -> Option<chrono::DateTime<chrono::Utc>> {
    let filetime = i64::from_le_bytes(data[offset..offset + 8].try_into().ok()?);
    event::from_filetime(filetime)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    data[offset..offset + 4]
        .try_into()
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

fn expand_known_folder(exec_path: &str) -> String {
    let prefix = exec_path.split('\\').next().unwrap_or("");
    for (guid, folder) in KNOWN_FOLDERS {
        if prefix.eq_ignore_ascii_case(guid) {
            return exec_path.replacen(prefix, folder, 1);
        }
    }
    exec_path.to_string()
}

pub(crate) fn rot13(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'a'..='z' => (((c as u8 - b'a' + 13) % 26) + b'a') as char,
            'A'..='Z' => (((c as u8 - b'A' + 13) % 26) + b'A') as char,
            other => other,
        })
        .collect()
}
