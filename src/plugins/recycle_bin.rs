//! Reader for Recycle Bin `$I` records.
//!
//! A `$I` file starts with three little-endian i64 values: format version,
//! original file size and the FILETIME deletion timestamp, followed by the
//! original path (fixed-size UTF-16 in version 1, length-prefixed in
//! version 2).

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::runtime::{event, ArtifactReader, Event, PluginContext};

const HEADER_LEN: usize = 24;
const V1_PATH_BYTES: usize = 250;

pub struct RecycleBinToTimeline;

impl RecycleBinToTimeline {
    pub fn new() -> Self {
        Self
    }
}

impl ArtifactReader for RecycleBinToTimeline {
    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let raw = fs::read(artifact)
            .with_context(|| format!("unable to read {}", artifact.display()))?;
        if raw.len() < HEADER_LEN {
            bail!("truncated $I record ({} bytes)", raw.len());
        }

        let version = read_i64(&raw, 0);
        let file_size = read_i64(&raw, 8);
        let deletion_filetime = read_i64(&raw, 16);

        let timestamp = event::from_filetime(deletion_filetime)
            .with_context(|| format!("deletion timestamp out of range: {deletion_filetime}"))?;

        let file_path = match version {
            1 => {
                // Windows Vista / 7 layout: fixed-size path field.
                let end = raw.len().min(HEADER_LEN + V1_PATH_BYTES);
                decode_utf16le(&raw[HEADER_LEN..end])
            }
            2 => {
                // Windows 10+ layout: u32 char count, then the path.
                if raw.len() < HEADER_LEN + 4 {
                    bail!("truncated $I v2 record");
                }
                let chars = u32::from_le_bytes(
                    raw[HEADER_LEN..HEADER_LEN + 4].try_into().expect("4 bytes"),
                ) as usize;
                let start = HEADER_LEN + 4;
                let end = raw.len().min(start + chars * 2);
                decode_utf16le(&raw[start..end])
            }
            other => {
                warn!(
                    "[RecycleBinToTimeline] [{}] Unexpected header value : {}",
                    ctx.hostname(),
                    other
                );
                return Ok(());
            }
        };

        ctx.add_event(Event {
            timestamp: Some(timestamp),
            source: ctx.original_path(artifact),
            description: format!("Deletion of file {file_path} - Filesize : {file_size}"),
            ..Default::default()
        })
    }
}

fn read_i64(raw: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(raw[offset..offset + 8].try_into().expect("8 bytes"))
}

fn decode_utf16le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .to_string()
}
