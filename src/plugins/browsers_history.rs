//! Generic reader for browser history SQLite databases.
//!
//! Browsers disagree on schema, so every table is dumped row by row; the
//! embedded timestamp map names the one column per table whose value is the
//! event timestamp. Values below one billion are treated as Unix epochs
//! (stored in microseconds), larger ones as WebKit/Chromium microseconds
//! since 1601.
//!
//! No magic-number filter is possible here: WAL siblings share the member
//! pattern but not the SQLite magic.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::runtime::{event, ArtifactReader, Event, PluginContext};

const TIMESTAMP_MAP: &str = include_str!("data/BrowsersHistoryToTimeline-timestampmap.json");

const UNIX_WEBKIT_PIVOT: i64 = 1_000_000_000;

pub struct BrowsersHistoryToTimeline {
    timestamp_map: HashMap<String, String>,
}

impl BrowsersHistoryToTimeline {
    pub fn new() -> Self {
        let timestamp_map = serde_json::from_str(TIMESTAMP_MAP).unwrap_or_else(|e| {
            warn!("invalid embedded timestamp map: {e}");
            HashMap::new()
        });
        Self { timestamp_map }
    }

    fn dump_table(
        &self,
        ctx: &mut PluginContext<'_>,
        conn: &Connection,
        table: &str,
        source: &str,
    ) -> Result<()> {
        let mut stmt = conn.prepare(&format!("SELECT * FROM \"{table}\""))?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let timestamp_column = self.timestamp_map.get(table);

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut description = format!("TableName: {table} - ");
            let mut timestamp = event::epoch();

            for (idx, column) in columns.iter().enumerate() {
                let value = row.get_ref(idx)?;
                description.push_str(&format!("{}: {} - ", column, render_value(value)));

                if timestamp_column == Some(column) {
                    if let ValueRef::Integer(raw) = value {
                        timestamp = browser_timestamp(raw).unwrap_or_else(event::epoch);
                    }
                }
            }

            ctx.add_event(Event {
                timestamp: Some(timestamp),
                source: source.to_string(),
                description,
                ..Default::default()
            })?;
        }
        Ok(())
    }
}

impl ArtifactReader for BrowsersHistoryToTimeline {
    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains("-shm_") || name.contains("-wal_") {
            return Ok(());
        }

        replay_wal(artifact);

        let conn = Connection::open(artifact)
            .with_context(|| format!("unable to open database {}", artifact.display()))?;
        let source = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let tables: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT name FROM main.sqlite_master WHERE type = 'table'")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<_, _>>()?;
            names
        };

        for table in &tables {
            self.dump_table(ctx, &conn, table, &source)?;
        }
        Ok(())
    }
}

/// Replay pending WAL transactions so the dump sees a complete database.
/// Failure is not fatal: the main database file is still usable.
fn replay_wal(artifact: &Path) {
    let result = (|| -> rusqlite::Result<()> {
        let conn = Connection::open(artifact)?;
        let integrity: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        debug!("Database integrity check result: {integrity}");
        let (busy, wal_size, checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        debug!(
            "Replayed wal transactions: busy={busy} wal_size={wal_size} checkpointed={checkpointed}"
        );
        Ok(())
    })();
    if let Err(e) = result {
        warn!(
            "Unable to replay database ({}) transactions. Error: {}",
            artifact.display(),
            e
        );
    }
}

/// Browser timestamp heuristics: small values are Unix epochs stored in
/// microseconds, large ones WebKit microseconds since 1601.
fn browser_timestamp(raw: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    if raw < UNIX_WEBKIT_PIVOT {
        event::from_unix_micros(raw)
    } else {
        event::from_webkit_micros(raw)
    }
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(n) => n.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Blob(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::run_reader;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_webkit_timestamp_and_dump() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("History.data");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE urls (id INTEGER PRIMARY KEY, url TEXT, title TEXT, \
                     last_visit_time INTEGER);\n\
                 INSERT INTO urls VALUES (1, 'https://example.org/', 'Example', \
                     13244444800000000);",
            )
            .unwrap();
        }

        let mut reader = BrowsersHistoryToTimeline::new();
        let lines = run_reader(&mut reader, &db_path, dir.path(), HashMap::new());

        assert_eq!(lines.len(), 1);
        // 13244444800000000 us since 1601 -> 2020-09-13 04:26:40 UTC.
        assert!(lines[0].starts_with("2020-09-13 04:26:40.000"));
        assert!(lines[0].contains("TableName: urls"));
        assert!(lines[0].contains("url: https://example.org/"));
    }

    #[test]
    fn test_rows_without_timestamp_map_to_epoch() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("Cookies.data");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE meta (key TEXT, value TEXT);\n\
                 INSERT INTO meta VALUES ('version', '12');",
            )
            .unwrap();
        }

        let mut reader = BrowsersHistoryToTimeline::new();
        let lines = run_reader(&mut reader, &db_path, dir.path(), HashMap::new());

        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("1970-01-01 00:00:00.000"));
        assert!(lines[0].contains("key: version - value: 12 - "));
    }

    #[test]
    fn test_wal_siblings_are_skipped() {
        let dir = tempdir().unwrap();
        let wal = dir.path().join("History-wal_data");
        std::fs::write(&wal, b"whatever").unwrap();

        let mut reader = BrowsersHistoryToTimeline::new();
        let lines = run_reader(&mut reader, &wal, dir.path(), HashMap::new());
        assert!(lines.is_empty());
    }

    #[test]
    fn test_browser_timestamp_pivot() {
        // Small values: microseconds since the Unix epoch.
        let unix = browser_timestamp(500_000_000).unwrap();
        assert_eq!(event::format_timestamp(&unix), "1970-01-01 00:08:20.000");
        // Large values: WebKit microseconds since 1601.
        let webkit = browser_timestamp(11_644_473_600_000_000).unwrap();
        assert_eq!(webkit, event::epoch());
    }
}
