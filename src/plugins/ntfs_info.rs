//! Reader for NTFSInfo CSV artifacts.
//!
//! Each NTFSInfo row carries eight MFT timestamps ($STANDARD_INFORMATION
//! and $FILE_NAME, MACB each). Timestamps sharing the same value collapse
//! into one event whose description flags which of them fired.

use std::path::Path;

use anyhow::Result;

use super::{parse_csv_with_recovery, CsvRow};
use crate::runtime::{ArtifactReader, Event, PluginContext};

const TIMESTAMP_FIELDS: [&str; 8] = [
    "CreationDate",
    "LastModificationDate",
    "LastAccessDate",
    "LastAttrChangeDate",
    "FileNameCreationDate",
    "FileNameLastModificationDate",
    "FileNameLastAccessDate",
    "FileNameLastAttrModificationDate",
];

const SI_FLAGS: [(&str, char); 4] = [
    ("LastModificationDate", 'M'),
    ("LastAccessDate", 'A'),
    ("LastAttrChangeDate", 'C'),
    ("CreationDate", 'B'),
];

const FN_FLAGS: [(&str, char); 4] = [
    ("FileNameLastModificationDate", 'M'),
    ("FileNameLastAccessDate", 'A'),
    ("FileNameLastAttrModificationDate", 'C'),
    ("FileNameCreationDate", 'B'),
];

pub struct NTFSInfoToTimeline {
    // Path separator inferred once from the first ParentName seen.
    separator: Option<String>,
}

impl NTFSInfoToTimeline {
    pub fn new() -> Self {
        Self { separator: None }
    }

    fn handle_row(
        &mut self,
        ctx: &mut PluginContext<'_>,
        row: &CsvRow<'_>,
        source: &str,
    ) -> Result<()> {
        let mut fields: Vec<&str> = TIMESTAMP_FIELDS.to_vec();
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
        // FilenameFlags 2 marks the DOS 8.3 short-name entry.
        if row.get("FilenameFlags") == Some("2") {
            return Ok(());
        }

        let mut meaning = String::from("$SI: ");
        for (field, flag) in SI_FLAGS {
            meaning.push(if group.contains(&field) { flag } else { '.' });
        }
        meaning.push_str(" - $FN: ");
        for (field, flag) in FN_FLAGS {
            meaning.push(if group.contains(&field) { flag } else { '.' });
        }

        let parent = row.get("ParentName").unwrap_or("");
        let separator = self
            .separator
            .get_or_insert_with(|| separator_for(parent))
            .clone();
        let name = format!("{}{}{}", parent, separator, row.get("File").unwrap_or(""));
        let size = row.get("SizeInBytes").unwrap_or("unknown");

        ctx.add_event(Event {
            timestamp_str: Some(ref_timestamp.to_string()),
            source: source.to_string(),
            description: format!("{meaning} - Name: {name} - Size in bytes: {size}"),
            ..Default::default()
        })
    }
}

impl ArtifactReader for NTFSInfoToTimeline {
    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let source = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parse_csv_with_recovery(ctx, artifact, |ctx, row| self.handle_row(ctx, row, &source))
    }
}

fn separator_for(parent_name: &str) -> String {
    if parent_name.ends_with('\\') {
        String::new()
    } else {
        "\\".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::run_reader;
    use std::collections::HashMap;
    use tempfile::tempdir;

    const HEADER: &str = "ComputerName,VolumeID,File,ParentName,SizeInBytes,CreationDate,LastModificationDate,LastAccessDate,LastAttrChangeDate,FileNameCreationDate,FileNameLastModificationDate,FileNameLastAccessDate,FileNameLastAttrModificationDate,FilenameFlags";

    #[test]
    fn test_all_identical_timestamps_collapse_to_one_event() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("NTFSInfo_00000001.csv");
        let ts = "2022-06-01 10:00:00.000";
        std::fs::write(
            &artifact,
            format!(
                "{HEADER}\nPC,1,file.txt,\\Users\\bob,42,{ts},{ts},{ts},{ts},{ts},{ts},{ts},{ts},0\n"
            ),
        )
        .unwrap();

        let mut reader = NTFSInfoToTimeline::new();
        let lines = run_reader(&mut reader, &artifact, dir.path(), HashMap::new());

        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("$SI: MACB - $FN: MACB"));
        assert!(lines[0].contains("Name: \\Users\\bob\\file.txt"));
        assert!(lines[0].contains("Size in bytes: 42"));
        assert!(lines[0].starts_with(ts));
    }

    #[test]
    fn test_distinct_timestamps_make_distinct_events() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("NTFSInfo_00000002.csv");
        let creation = "2020-01-01 00:00:00.000";
        let others = "2021-01-01 00:00:00.000";
        std::fs::write(
            &artifact,
            format!(
                "{HEADER}\nPC,1,a.txt,\\,10,{creation},{others},{others},{others},{creation},{others},{others},{others},0\n"
            ),
        )
        .unwrap();

        let mut reader = NTFSInfoToTimeline::new();
        let lines = run_reader(&mut reader, &artifact, dir.path(), HashMap::new());

        assert_eq!(lines.len(), 2);
        let creation_line = lines.iter().find(|l| l.starts_with(creation)).unwrap();
        assert!(creation_line.contains("$SI: ...B - $FN: ...B"));
        let others_line = lines.iter().find(|l| l.starts_with(others)).unwrap();
        assert!(others_line.contains("$SI: MAC. - $FN: MAC."));
    }

    #[test]
    fn test_short_name_entries_skipped() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("NTFSInfo_00000003.csv");
        let ts = "2022-06-01 10:00:00.000";
        std::fs::write(
            &artifact,
            format!(
                "{HEADER}\nPC,1,FILE~1.TXT,\\,42,{ts},{ts},{ts},{ts},{ts},{ts},{ts},{ts},2\n"
            ),
        )
        .unwrap();

        let mut reader = NTFSInfoToTimeline::new();
        let lines = run_reader(&mut reader, &artifact, dir.path(), HashMap::new());
        assert!(lines.is_empty());
    }

    #[test]
    fn test_nul_contaminated_file_takes_recovery_path() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("NTFSInfo_00000004.csv");
        let ts = "2022-06-01 10:00:00.000";
        let mut content = format!(
            "{HEADER}\nPC,1,fi\0le.txt,\\Users,42,{ts},{ts},{ts},{ts},{ts},{ts},{ts},{ts},0\n"
        )
        .into_bytes();
        content.push(0);
        std::fs::write(&artifact, content).unwrap();

        let mut reader = NTFSInfoToTimeline::new();
        let lines = run_reader(&mut reader, &artifact, dir.path(), HashMap::new());

        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Name: \\Users\\file.txt"));
    }

    #[test]
    fn test_separator_for() {
        assert_eq!(separator_for(""), "\\");
        assert_eq!(separator_for("\\"), "");
        assert_eq!(separator_for("\\Users"), "\\");
        assert_eq!(separator_for("\\Users\\"), "");
    }
}
