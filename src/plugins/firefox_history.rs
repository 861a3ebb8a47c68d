//! Reader for Firefox history databases (places.sqlite).
//!
//! The database schema is validated against the moz_* tables a history
//! database must carry before the visit join runs; staged files that are
//! only WAL or shared-memory siblings are skipped.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::runtime::{event, ArtifactReader, Event, PluginContext};

const VISITS_QUERY: &str = "SELECT moz_historyvisits.id, moz_places.url, moz_places.title, \
     moz_places.visit_count, moz_historyvisits.visit_date, \
     (SELECT moz_places.url FROM moz_places WHERE moz_historyvisits.from_visit = moz_places.id) AS referer_name, \
     moz_historyvisits.from_visit, moz_places.rev_host, \
     moz_places.hidden, moz_places.typed, moz_historyvisits.visit_type \
     FROM moz_places, moz_historyvisits \
     WHERE moz_places.id = moz_historyvisits.place_id";

pub struct FirefoxHistoryToTimeline;

impl FirefoxHistoryToTimeline {
    pub fn new() -> Self {
        Self
    }
}

fn required_structure() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![
        (
            "moz_places",
            vec!["url", "title", "visit_count", "rev_host", "hidden", "typed", "id"],
        ),
        (
            "moz_historyvisits",
            vec!["id", "visit_date", "from_visit", "visit_type", "place_id"],
        ),
        (
            "moz_bookmarks",
            vec!["type", "title", "dateAdded", "lastModified", "id", "fk"],
        ),
        (
            "moz_items_annos",
            vec!["content", "dateAdded", "lastModified", "id", "item_id"],
        ),
    ]
}

impl ArtifactReader for FirefoxHistoryToTimeline {
    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains("places.sqlite-wal") || name.contains("places.sqlite-shm") {
            return Ok(());
        }

        let conn = Connection::open(artifact)
            .with_context(|| format!("unable to open database {}", artifact.display()))?;

        if !validate_schema(&conn)? {
            return Ok(());
        }

        let source = ctx.original_path(artifact);
        let mut stmt = conn
            .prepare(VISITS_QUERY)
            .context("history query preparation failed")?;
        let mut rows = stmt.query([]).context("history query failed")?;

        while let Some(row) = rows.next()? {
            let url: Option<String> = row.get("url")?;
            let title: Option<String> = row.get("title")?;
            let visit_count: Option<i64> = row.get("visit_count")?;
            let typed: Option<i64> = row.get("typed")?;
            let referer: Option<String> = row.get("referer_name")?;
            let visit_date: Option<i64> = row.get("visit_date")?;

            let description = format!(
                "Url: {} - Title: {} - Count: {} - Typed: {} - Referer: {}",
                url.unwrap_or_default(),
                title.unwrap_or_default(),
                visit_count.unwrap_or_default(),
                typed.unwrap_or_default(),
                referer.unwrap_or_default()
            );
            // A null visit_date leaves the timestamp unset; the emitter
            // logs it and substitutes the epoch.
            ctx.add_event(Event {
                timestamp: visit_date.and_then(event::from_unix_micros),
                source: source.clone(),
                description,
                ..Default::default()
            })?;
        }
        Ok(())
    }
}

/// The database is a history database when every required table exists with
/// every required column.
fn validate_schema(conn: &Connection) -> Result<bool> {
    let mut stmt = conn.prepare(
        "SELECT tbl_name FROM sqlite_master WHERE type = 'table' \
         AND tbl_name != 'xp_proc' AND tbl_name != 'sqlite_sequence'",
    )?;
    let tables: HashSet<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut columns_per_table: HashMap<String, HashSet<String>> = HashMap::new();
    for table in &tables {
        let mut pragma = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
        let columns: HashSet<String> = pragma
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        columns_per_table.insert(table.clone(), columns);
    }

    for (required_table, required_columns) in required_structure() {
        let Some(columns) = columns_per_table.get(required_table) else {
            return Ok(false);
        };
        if !required_columns.iter().all(|c| columns.contains(*c)) {
            return Ok(false);
        }
    }
    Ok(true)
}
