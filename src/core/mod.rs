//! Core module - host discovery, per-host merging and job coordination.

mod coordinator;
mod merger;

pub use coordinator::{process, process_dir, PluginOutcome};
pub use merger::{merge_timelines_for_host, CSV_HEADER, MAX_OPEN_FILES};

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// Archive names must match this to belong to a host; the capture group is
/// the hostname.
pub const ORC_REGEX: &str = r"^(?:DFIR-)?ORC_[^_]*_(.*)_[^_]*\.7z$";

/// Extension of every final timeline file.
pub const RESULT_EXTENSION: &str = ".csv.gz";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("duplicate hostnames in input directory: {0:?}")]
    DuplicateHostnames(Vec<String>),
}

/// Everything needed to process one host: its archives and where the final
/// timeline goes.
#[derive(Debug, Clone)]
pub struct HostTask {
    pub hostname: String,
    pub output_path: PathBuf,
    pub orc_paths: Vec<PathBuf>,
}

fn orc_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ORC_REGEX).expect("hostname regex is valid"))
}

/// Hostname captured from an ORC archive file name, if it matches.
pub fn hostname_from_archive(file_name: &str) -> Option<String> {
    orc_regex()
        .captures(file_name)
        .map(|caps| caps[1].to_string())
}

/// Crawl `input_dir` recursively and group matching archives into one task
/// per output path, mirroring the input layout below `output_dir`.
pub fn host_tasks_from_dir(input_dir: &Path, output_dir: &Path) -> Vec<HostTask> {
    let mut tasks: Vec<HostTask> = Vec::new();
    let mut index: HashMap<PathBuf, usize> = HashMap::new();

    for entry in WalkDir::new(input_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Some(hostname) = hostname_from_archive(&entry.file_name().to_string_lossy()) else {
            continue;
        };
        let relative_parent = entry
            .path()
            .parent()
            .and_then(|p| p.strip_prefix(input_dir).ok())
            .unwrap_or_else(|| Path::new(""));
        let output_path = output_dir
            .join(relative_parent)
            .join(format!("{hostname}{RESULT_EXTENSION}"));

        match index.get(&output_path) {
            Some(&i) => tasks[i].orc_paths.push(entry.into_path()),
            None => {
                index.insert(output_path.clone(), tasks.len());
                tasks.push(HostTask {
                    hostname,
                    output_path,
                    orc_paths: vec![entry.into_path()],
                });
            }
        }
    }

    tasks
}

/// Directory mode cannot process the same host twice; report the offending
/// hostnames and fail.
pub fn check_unique_hostnames(tasks: &[HostTask]) -> Result<(), CoreError> {
    let mut seen = HashSet::new();
    let mut dupes = HashSet::new();
    for task in tasks {
        if !seen.insert(task.hostname.as_str()) {
            dupes.insert(task.hostname.clone());
        }
    }
    if dupes.is_empty() {
        return Ok(());
    }
    let mut dupes: Vec<String> = dupes.into_iter().collect();
    dupes.sort();
    error!("Unable to process directory if the same host is used many times.");
    error!(
        "Hint, these hosts seem to be the source of the problem : {:?}",
        dupes
    );
    Err(CoreError::DuplicateHostnames(dupes))
}

/// Drop tasks whose output already exists (unless overwriting) and make
/// sure the remaining output directories exist.
pub fn filter_existing_outputs(tasks: Vec<HostTask>, overwrite: bool) -> Result<Vec<HostTask>> {
    let mut kept = Vec::new();
    for task in tasks {
        if task.output_path.exists() && !overwrite {
            warn!(
                "Output file '{}' already exists, processing will be ignored for host {} \
                 use '--overwrite' if you know what you are doing.",
                task.output_path.display(),
                task.hostname
            );
            continue;
        }
        if let Some(parent) = task.output_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("unable to create output directory {}", parent.display())
            })?;
        }
        kept.push(task);
    }
    Ok(kept)
}

/// Log which files feed which host before processing starts.
pub(crate) fn print_intro(tasks: &[HostTask]) {
    for task in tasks {
        info!("==============================================");
        info!("Host: {}", task.hostname);
        info!(
            "Files used: [{}]",
            task.orc_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        info!("Result file: {}", task.output_path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hostname_extraction() {
        assert_eq!(
            hostname_from_archive("ORC_Server_FAKEMACHINE_General.7z"),
            Some("FAKEMACHINE".to_string())
        );
        assert_eq!(
            hostname_from_archive("DFIR-ORC_WorkStation_DESKTOP-123_Little.7z"),
            Some("DESKTOP-123".to_string())
        );
        // The greedy capture keeps embedded underscores.
        assert_eq!(
            hostname_from_archive("ORC_Server_MY_HOST_Detail.7z"),
            Some("MY_HOST".to_string())
        );
        assert_eq!(hostname_from_archive("random.7z"), None);
        assert_eq!(hostname_from_archive("ORC_Server_HOST_General.zip"), None);
        assert_eq!(hostname_from_archive("notes.txt"), None);
    }

    #[test]
    fn test_host_tasks_from_dir_groups_and_mirrors_layout() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        let sub = input.path().join("case1");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("ORC_Server_ALPHA_General.7z"), b"x").unwrap();
        fs::write(sub.join("ORC_Server_ALPHA_Detail.7z"), b"x").unwrap();
        fs::write(input.path().join("ORC_Server_BETA_General.7z"), b"x").unwrap();
        fs::write(input.path().join("README.md"), b"x").unwrap();

        let mut tasks = host_tasks_from_dir(input.path(), output.path());
        tasks.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].hostname, "ALPHA");
        assert_eq!(tasks[0].orc_paths.len(), 2);
        assert_eq!(
            tasks[0].output_path,
            output.path().join("case1").join("ALPHA.csv.gz")
        );
        assert_eq!(tasks[1].hostname, "BETA");
        assert_eq!(
            tasks[1].output_path,
            output.path().join("BETA.csv.gz")
        );
    }

    #[test]
    fn test_check_unique_hostnames() {
        let task = |host: &str| HostTask {
            hostname: host.to_string(),
            output_path: PathBuf::from(format!("{host}.csv.gz")),
            orc_paths: Vec::new(),
        };
        assert!(check_unique_hostnames(&[task("A"), task("B")]).is_ok());

        let err = check_unique_hostnames(&[task("A"), task("B"), task("A")]).unwrap_err();
        match err {
            CoreError::DuplicateHostnames(hosts) => assert_eq!(hosts, vec!["A".to_string()]),
        }
    }

    #[test]
    fn test_filter_existing_outputs() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("EXISTS.csv.gz");
        fs::write(&existing, b"old").unwrap();

        let tasks = vec![
            HostTask {
                hostname: "EXISTS".to_string(),
                output_path: existing.clone(),
                orc_paths: Vec::new(),
            },
            HostTask {
                hostname: "NEW".to_string(),
                output_path: dir.path().join("deep").join("NEW.csv.gz"),
                orc_paths: Vec::new(),
            },
        ];

        let kept = filter_existing_outputs(tasks.clone(), false).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].hostname, "NEW");
        // Parent directory was created; the existing file is untouched.
        assert!(dir.path().join("deep").is_dir());
        assert_eq!(fs::read(&existing).unwrap(), b"old");

        let kept = filter_existing_outputs(tasks, true).unwrap();
        assert_eq!(kept.len(), 2);
    }
}
