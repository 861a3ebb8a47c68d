//! Reader for USNInfo CSV artifacts (USN journal dumps).

use std::path::Path;

use anyhow::Result;
use tracing::warn;

use super::{parse_csv_with_recovery, CsvRow};
use crate::runtime::{ArtifactReader, Event, PluginContext};

pub struct USNInfoToTimeline;

impl USNInfoToTimeline {
    pub fn new() -> Self {
        Self
    }

    fn handle_row(
        &mut self,
        ctx: &mut PluginContext<'_>,
        row: &CsvRow<'_>,
        source: &str,
    ) -> Result<()> {
        // Concatenated dumps repeat the header line mid-file.
        if row.get("USN") == Some("USN") {
            return Ok(());
        }
        let Some(timestamp) = row.get("TimeStamp") else {
            return Ok(());
        };

        // The low 32 bits of the FRN are the MFT segment number.
        let mft_segment_number = row
            .get("FRN")
            .and_then(|frn| parse_hex(frn))
            .map(|frn| frn & 0xFFFF_FFFF)
            .unwrap_or_else(|| {
                warn!("Error while getting FRN from {}", source);
                0
            });

        let full_path = row.get("FullPath").unwrap_or("");
        let reason = row.get("Reason").unwrap_or("");

        ctx.add_event(Event {
            timestamp_str: Some(timestamp.to_string()),
            source: source.to_string(),
            description: format!(
                "{full_path} - {reason} - MFT segment num : {mft_segment_number}"
            ),
            ..Default::default()
        })
    }
}

impl ArtifactReader for USNInfoToTimeline {
    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let source = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parse_csv_with_recovery(ctx, artifact, |ctx, row| self.handle_row(ctx, row, &source))
    }
}

pub(crate) fn parse_hex(value: &str) -> Option<u64> {
    let trimmed = value
        .trim()
        .strip_prefix("0x")
        .or_else(|| value.trim().strip_prefix("0X"))
        .unwrap_or_else(|| value.trim());
    u64::from_str_radix(trimmed, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::run_reader;
    use std::collections::HashMap;
    use tempfile::tempdir;

    const HEADER: &str = "ComputerName,VolumeID,USN,FRN,ParentFRN,FullPath,TimeStamp,Reason";

    #[test]
    fn test_usn_rows_become_events() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("USNInfo_C.csv");
        std::fs::write(
            &artifact,
            format!(
                "{HEADER}\n\
                 PC,1,0x100,0x200000000001A2B3,0x1,\\Windows\\notepad.exe,2021-05-05 12:00:00.000,FILE_CREATE\n\
                 PC,1,USN,FRN,ParentFRN,FullPath,USN,Reason\n"
            ),
        )
        .unwrap();

        let mut reader = USNInfoToTimeline::new();
        let lines = run_reader(&mut reader, &artifact, dir.path(), HashMap::new());

        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("2021-05-05 12:00:00.000"));
        // 0x1A2B3 masked from the full FRN.
        assert!(lines[0]
            .contains("\\Windows\\notepad.exe - FILE_CREATE - MFT segment num : 107187"));
    }

    #[test]
    fn test_unparseable_frn_defaults_to_zero() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("USNInfo_D.csv");
        std::fs::write(
            &artifact,
            format!("{HEADER}\nPC,1,0x100,zzz,0x1,\\a,2021-05-05 12:00:00.000,CLOSE\n"),
        )
        .unwrap();

        let mut reader = USNInfoToTimeline::new();
        let lines = run_reader(&mut reader, &artifact, dir.path(), HashMap::new());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("MFT segment num : 0"));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x1A"), Some(0x1A));
        assert_eq!(parse_hex("1a"), Some(0x1A));
        assert_eq!(parse_hex(" 0X0001 "), Some(1));
        assert_eq!(parse_hex("nope"), None);
    }
}
