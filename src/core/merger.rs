//! Per-host merge of sorted run files into the final timeline.
//!
//! Run files are merged in passes of at most `MAX_OPEN_FILES` inputs so the
//! process never runs into the OS open-file limit (512 on Windows, hence the
//! conservative 300). Adjacent duplicate lines are suppressed; the unique
//! event count is taken on the final pass only.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;
use walkdir::WalkDir;

/// Hard cap on simultaneously open merge inputs.
pub const MAX_OPEN_FILES: usize = 300;

/// Header line of every final timeline file.
pub const CSV_HEADER: &str = "Timestamp,Hostname,SourceType,Description,SourceFile";

/// Merge every run file of `hostname` found under `temp_dir` into the
/// gzip-compressed timeline at `output_path`, returning the number of
/// unique events. Consumed run files are deleted.
pub fn merge_timelines_for_host(
    hostname: &str,
    temp_dir: &Path,
    output_path: &Path,
) -> Result<u64> {
    info!(
        "Merging all timelines generated per artefact for host {}",
        hostname
    );
    let run_files = collect_run_files(temp_dir, hostname);
    let count = merge_sorted_files(run_files.clone(), output_path, temp_dir)?;

    for file in &run_files {
        let _ = fs::remove_file(file);
    }
    Ok(count)
}

/// All run files matching `timeline_<hostname>_*` under `temp_dir`.
fn collect_run_files(temp_dir: &Path, hostname: &str) -> Vec<PathBuf> {
    let prefix = format!("timeline_{hostname}_");
    WalkDir::new(temp_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .map(|e| e.into_path())
        .collect()
}

/// Multi-pass k-way merge of locally-sorted input files.
fn merge_sorted_files(paths: Vec<PathBuf>, output_path: &Path, temp_dir: &Path) -> Result<u64> {
    let mut queue = paths;
    let mut events_count = 0u64;
    let mut intermediate: Option<PathBuf> = None;

    while !queue.is_empty() {
        // The previous pass's output participates in this pass and counts
        // against the open-file cap; it is deleted once consumed.
        let consumed_intermediate = intermediate.take();
        let cap = MAX_OPEN_FILES - usize::from(consumed_intermediate.is_some());
        let take = queue.len().min(cap);
        let mut batch: Vec<PathBuf> = queue.drain(..take).collect();
        let last_pass = queue.is_empty();

        if let Some(prev) = &consumed_intermediate {
            batch.push(prev.clone());
        }

        let tmp = tempfile::Builder::new()
            .prefix("merge_")
            .tempfile_in(temp_dir)
            .context("unable to create merge intermediate")?;
        let (out_file, out_path) = tmp
            .keep()
            .context("unable to persist merge intermediate")?;

        events_count = merge_one_pass(&batch, out_file, last_pass)?;

        if let Some(prev) = consumed_intermediate {
            let _ = fs::remove_file(prev);
        }
        intermediate = Some(out_path);
    }

    write_final_output(output_path, intermediate.as_deref())?;
    if let Some(final_path) = intermediate {
        let _ = fs::remove_file(final_path);
    }
    Ok(events_count)
}

/// Heap-merge one batch of sorted inputs into `out_file`, suppressing
/// adjacent duplicates. Returns the number of emitted lines when
/// `count_lines` is set, 0 otherwise.
fn merge_one_pass(batch: &[PathBuf], out_file: File, count_lines: bool) -> Result<u64> {
    let mut inputs = Vec::with_capacity(batch.len());
    for path in batch {
        let file = File::open(path)
            .with_context(|| format!("unable to open run file {}", path.display()))?;
        inputs.push(BufReader::new(file));
    }

    let mut writer = BufWriter::new(out_file);
    // Min-heap keyed on (line bytes, input index); equal lines tie-break on
    // the input index, which dedup makes irrelevant to the output.
    let mut heap: BinaryHeap<Reverse<(Vec<u8>, usize)>> = BinaryHeap::new();
    for (index, input) in inputs.iter_mut().enumerate() {
        if let Some(line) = read_line(input)? {
            heap.push(Reverse((line, index)));
        }
    }

    let mut emitted = 0u64;
    let mut previous: Vec<u8> = Vec::new();
    while let Some(Reverse((line, index))) = heap.pop() {
        if line != previous {
            writer.write_all(&line)?;
            emitted += 1;
            previous = line;
        }
        if let Some(next) = read_line(&mut inputs[index])? {
            heap.push(Reverse((next, index)));
        }
    }
    writer.flush()?;

    Ok(if count_lines { emitted } else { 0 })
}

/// One line including its terminator, or `None` at end of file.
fn read_line(reader: &mut BufReader<File>) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line)?;
    if read == 0 {
        Ok(None)
    } else {
        Ok(Some(line))
    }
}

/// Write the gzip output: header line first, then the merged content.
fn write_final_output(output_path: &Path, merged: Option<&Path>) -> Result<()> {
    let out_file = File::create(output_path)
        .with_context(|| format!("unable to create output file {}", output_path.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(out_file), Compression::default());
    encoder.write_all(CSV_HEADER.as_bytes())?;
    encoder.write_all(b"\n")?;

    if let Some(merged) = merged {
        let mut reader = BufReader::new(
            File::open(merged)
                .with_context(|| format!("unable to open merge result {}", merged.display()))?,
        );
        std::io::copy(&mut reader, &mut encoder)?;
    }

    let inner = encoder.finish().context("unable to finish gzip stream")?;
    inner
        .into_inner()
        .map_err(|e| anyhow::anyhow!("unable to flush output file: {}", e))?;
    Ok(())
}
