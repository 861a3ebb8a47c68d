//! Reader for I30Info CSV artifacts ($I30 slack-space entries).
//!
//! Only carved entries matter here: live entries are already covered by
//! NTFSInfo. $FILE_NAME timestamps sharing a value collapse into one event.

use std::path::Path;

use anyhow::{Context, Result};

use super::usn_info::parse_hex;
use super::{parse_csv_with_recovery, CsvRow};
use crate::runtime::{ArtifactReader, Event, PluginContext};

const FN_FIELDS: [&str; 4] = [
    "FileNameCreationDate",
    "FileNameLastModificationDate",
    "FileNameLastAccessDate",
    "FileNameLastAttrModificationDate",
];

const FN_FLAGS: [(&str, char); 4] = [
    ("FileNameLastModificationDate", 'M'),
    ("FileNameLastAccessDate", 'A'),
    ("FileNameLastAttrModificationDate", 'C'),
    ("FileNameCreationDate", 'B'),
];

pub struct I30InfoToTimeline;

impl I30InfoToTimeline {
    pub fn new() -> Self {
        Self
    }

    fn handle_row(
        &mut self,
        ctx: &mut PluginContext<'_>,
        row: &CsvRow<'_>,
        source: &str,
    ) -> Result<()> {
        if row.get("CarvedEntry") != Some("Y") {
            return Ok(());
        }

        let mut fields: Vec<&str> = FN_FIELDS.to_vec();
        while let Some(ref_field) = fields.pop() {
            let Some(ref_timestamp) = row.get(ref_field).map(str::to_string) else {
                continue;
            };
            let mut group = vec![ref_field];
            group.extend(
                fields
                    .iter()
                    .copied()
                    .filter(|field| row.get(field) == Some(ref_timestamp.as_str())),
            );

            self.emit_group(ctx, row, source, &group, &ref_timestamp)?;

            fields.retain(|field| !group.contains(field));
        }
        Ok(())
    }

    fn emit_group(
        &mut self,
        ctx: &mut PluginContext<'_>,
        row: &CsvRow<'_>,
        source: &str,
        group: &[&str],
        ref_timestamp: &str,
    ) -> Result<()> {
        let mut meaning = String::new();
        for (field, flag) in FN_FLAGS {
            meaning.push(if group.contains(&field) { flag } else { '.' });
        }

        let frn = row.get("FRN").unwrap_or("");
        let mft_segment = parse_hex(frn)
            .map(|value| value & 0xFFFF_FFFF_FFFF)
            .with_context(|| format!("unable to parse FRN '{frn}'"))?;

        ctx.add_event(Event {
            timestamp_str: Some(ref_timestamp.to_string()),
            source: source.to_string(),
            description: format!(
                "Entry in slackspace - $FN: {} - Name: {} - MFT segment num: {} - Parent FRN: {} ",
                meaning,
                row.get("Name").unwrap_or(""),
                mft_segment,
                row.get("ParentFRN").unwrap_or("")
            ),
            ..Default::default()
        })
    }
}

impl ArtifactReader for I30InfoToTimeline {
    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let source = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parse_csv_with_recovery(ctx, artifact, |ctx, row| self.handle_row(ctx, row, &source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::run_reader;
    use std::collections::HashMap;
    use tempfile::tempdir;

    const HEADER: &str = "ComputerName,VolumeID,CarvedEntry,FRN,ParentFRN,Name,FileNameCreationDate,FileNameLastModificationDate,FileNameLastAccessDate,FileNameLastAttrModificationDate";

    #[test]
    fn test_carved_entries_become_events() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("I30Info_C.csv");
        let ts = "2019-03-03 03:03:03.000";
        std::fs::write(
            &artifact,
            format!(
                "{HEADER}\nPC,1,Y,0x10000000000000FF,0x5,deleted.doc,{ts},{ts},{ts},{ts}\n"
            ),
        )
        .unwrap();

        let mut reader = I30InfoToTimeline::new();
        let lines = run_reader(&mut reader, &artifact, dir.path(), HashMap::new());

        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Entry in slackspace - $FN: MACB"));
        assert!(lines[0].contains("Name: deleted.doc"));
        assert!(lines[0].contains("MFT segment num: 255"));
        assert!(lines[0].contains("Parent FRN: 0x5"));
    }

    #[test]
    fn test_live_entries_skipped() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("I30Info_D.csv");
        let ts = "2019-03-03 03:03:03.000";
        std::fs::write(
            &artifact,
            format!("{HEADER}\nPC,1,N,0x1,0x5,live.doc,{ts},{ts},{ts},{ts}\n"),
        )
        .unwrap();

        let mut reader = I30InfoToTimeline::new();
        let lines = run_reader(&mut reader, &artifact, dir.path(), HashMap::new());
        assert!(lines.is_empty());
    }
}
