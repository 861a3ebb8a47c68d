//! Sorted chunks and run-file rotation.
//!
//! Events are not written straight to disk: rows accumulate in a bounded
//! in-memory chunk that keeps them sorted, and a full chunk is spilled as
//! one locally-sorted run file. The merger later assumes every run file is
//! already ordered, which is why each chunk gets a fresh file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use tracing::error;

use super::event::{self, Event};

/// Rows buffered in memory before a chunk is spilled to disk.
pub const CHUNK_CAPACITY: usize = 10_000;

const NONCE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const NONCE_LEN: usize = 5;

/// Bounded container keeping formatted rows in sorted order.
#[derive(Debug)]
pub struct SortedChunk {
    lines: Vec<String>,
    capacity: usize,
}

impl SortedChunk {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Vec::new(),
            capacity,
        }
    }

    /// Binary-insert a row, keeping iteration order sorted.
    pub fn insert(&mut self, line: String) {
        let idx = self.lines.binary_search(&line).unwrap_or_else(|i| i);
        self.lines.insert(idx, line);
    }

    pub fn is_full(&self) -> bool {
        self.lines.len() > self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }

    fn clear(&mut self) {
        self.lines.clear();
    }
}

#[derive(Debug)]
struct RunFile {
    path: PathBuf,
    rows: u64,
}

/// Funnels events into sorted run files named
/// `timeline_<host>_<plugin>_<nonce>_nb<N>` under the shared temp directory.
///
/// The nonce avoids collisions between parallel plugin instances working on
/// the same host. Artifact boundaries bound the blast radius of a rollback:
/// only run files written since the last boundary are discarded.
pub struct ChunkWriter {
    temp_dir: PathBuf,
    prefix: String,
    hostname: String,
    sourcetype: String,
    chunk: SortedChunk,
    file_nb: u32,
    run_files: Vec<RunFile>,
    boundary: usize,
    written_rows: u64,
}

impl ChunkWriter {
    pub fn new(temp_dir: &Path, hostname: &str, plugin_name: &str, sourcetype: &str) -> Self {
        let prefix = format!("timeline_{}_{}_{}", hostname, plugin_name, nonce());
        Self {
            temp_dir: temp_dir.to_path_buf(),
            prefix,
            hostname: hostname.to_string(),
            sourcetype: sourcetype.to_string(),
            chunk: SortedChunk::new(CHUNK_CAPACITY),
            file_nb: 0,
            run_files: Vec::new(),
            boundary: 0,
            written_rows: 0,
        }
    }

    /// Format and buffer one event; spills the chunk when it overflows.
    ///
    /// Events with an empty description are dropped silently. An event
    /// without any timestamp maps to the epoch and is logged as critical.
    pub fn add_event(&mut self, event: &Event) -> Result<()> {
        if event.description.is_empty() {
            return Ok(());
        }

        let timestamp = match (&event.timestamp_str, &event.timestamp) {
            (Some(s), _) if !s.is_empty() => s.clone(),
            (_, Some(ts)) => event::format_timestamp(ts),
            _ => {
                error!(
                    "No timestamp given for event with source {}",
                    event.source
                );
                event::format_timestamp(&event::epoch())
            }
        };

        let line = format_row(&[
            &timestamp,
            &self.hostname,
            &self.sourcetype,
            &event.description,
            &event.source,
        ])?;
        self.chunk.insert(line);

        if self.chunk.is_full() {
            self.flush_chunk()?;
        }
        Ok(())
    }

    /// Spill the current chunk as one new run file.
    fn flush_chunk(&mut self) -> Result<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        let path = self
            .temp_dir
            .join(format!("{}_nb{}", self.prefix, self.file_nb));
        self.file_nb += 1;

        let file = File::create(&path)
            .with_context(|| format!("unable to create run file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let lines = self.chunk.take();
        for line in &lines {
            writer.write_all(line.as_bytes())?;
        }
        writer.flush()?;

        let rows = lines.len() as u64;
        self.written_rows += rows;
        self.run_files.push(RunFile { path, rows });
        Ok(())
    }

    /// Mark the start of a new artifact. A later rollback only discards
    /// rows emitted after this point.
    pub fn artifact_boundary(&mut self) -> Result<()> {
        self.flush_chunk()?;
        self.boundary = self.run_files.len();
        Ok(())
    }

    /// Discard everything emitted since the last artifact boundary: delete
    /// the run files, subtract their rows and empty the chunk.
    pub fn rollback(&mut self) -> Result<()> {
        self.chunk.clear();
        for run in self.run_files.drain(self.boundary..) {
            error!("Deleting {}", run.path.display());
            self.written_rows = self.written_rows.saturating_sub(run.rows);
            if let Err(e) = fs::remove_file(&run.path) {
                error!("unable to delete {}: {}", run.path.display(), e);
            }
        }
        error!("Reinitialization of chunks");
        Ok(())
    }

    /// Flush the remaining chunk and return the total rows written across
    /// all surviving run files.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_chunk()?;
        Ok(self.written_rows)
    }

    /// Paths of the run files spilled so far.
    pub fn run_file_paths(&self) -> Vec<PathBuf> {
        self.run_files.iter().map(|r| r.path.clone()).collect()
    }
}

/// Encode one row as CSV: comma delimiter, double-quote quoting with quote
/// doubling, quoting only when needed. Embedded newlines are escaped first
/// so the serializer stays byte-stable and one event stays one line.
pub fn format_row(fields: &[&str]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    let sanitized: Vec<String> = fields.iter().map(|f| sanitize_field(f)).collect();
    writer.write_record(&sanitized)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("unable to finalize csv row: {}", e))?;
    String::from_utf8(bytes).context("csv row is not valid utf-8")
}

fn sanitize_field(field: &str) -> String {
    field.replace('\n', "\\n").replace('\r', "\\r")
}

fn nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..NONCE_LEN)
        .map(|_| NONCE_CHARSET[rng.gen_range(0..NONCE_CHARSET.len())] as char)
        .collect()
}
