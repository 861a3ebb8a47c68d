//! Job Coordinator - fans plugin executions over a worker pool and drives
//! the per-host merges.
//!
//! Every (host, plugin-config) pair becomes one isolated plugin instance
//! with its own scratch directory and run-file nonce. Instances run
//! serially when `jobs <= 1`, otherwise on a dedicated rayon pool; merges
//! are parallelized under the same bound. A failing instance never poisons
//! its siblings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{error, info};

use super::{check_unique_hostnames, merge_timelines_for_host, print_intro, HostTask};
use crate::config::{Config, PluginConfig};
use crate::plugins;
use crate::runtime::PluginRuntime;

/// Row count reported by one plugin instance, for the final summary.
#[derive(Debug, Clone)]
pub struct PluginOutcome {
    pub hostname: String,
    pub plugin_name: String,
    pub rows: u64,
}

struct PluginJob {
    hostname: String,
    orc_paths: Vec<PathBuf>,
    config: PluginConfig,
}

/// Create a timeline for one host from the given archives. Returns the
/// number of unique events in the final timeline.
pub fn process(
    file_list: Vec<PathBuf>,
    output_path: &Path,
    hostname: &str,
    jobs: usize,
    config: &Config,
) -> Result<u64> {
    info!("Processing files for host: {}", hostname);
    let task = HostTask {
        hostname: hostname.to_string(),
        output_path: output_path.to_path_buf(),
        orc_paths: file_list,
    };
    process_tasks(vec![task], jobs, config)
}

/// Process a batch of host tasks coming from a directory scan. Fails before
/// any processing when two tasks share a hostname.
pub fn process_dir(tasks: Vec<HostTask>, jobs: usize, config: &Config) -> Result<u64> {
    check_unique_hostnames(&tasks)?;
    print_intro(&tasks);
    process_tasks(tasks, jobs, config)
}

fn process_tasks(tasks: Vec<HostTask>, jobs: usize, config: &Config) -> Result<u64> {
    let temp_root = tempfile::Builder::new()
        .prefix("OrcTimelineTempDir_")
        .tempdir()
        .context("unable to create temporary directory")?;

    // The advisory lock only exists when instances actually run in
    // parallel; readers take it around non-reentrant critical sections.
    let lock = (jobs > 1).then(|| Arc::new(Mutex::new(())));

    let mut plugin_jobs = Vec::new();
    for task in &tasks {
        for plugin_config in &config.plugin_configs {
            plugin_jobs.push(PluginJob {
                hostname: task.hostname.clone(),
                orc_paths: task.orc_paths.clone(),
                config: plugin_config.clone(),
            });
        }
    }

    let outcomes: Vec<PluginOutcome>;
    let host_totals: Vec<(String, u64)>;

    if jobs <= 1 {
        outcomes = plugin_jobs
            .iter()
            .map(|job| run_plugin(job, temp_root.path(), lock.clone()))
            .collect();
        host_totals = tasks
            .iter()
            .map(|task| merge_host(task, temp_root.path()))
            .collect();
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .context("unable to build worker pool")?;
        outcomes = pool.install(|| {
            plugin_jobs
                .par_iter()
                .map(|job| run_plugin(job, temp_root.path(), lock.clone()))
                .collect()
        });
        host_totals = pool.install(|| {
            tasks
                .par_iter()
                .map(|task| merge_host(task, temp_root.path()))
                .collect()
        });
    }

    print_summaries(&host_totals, &outcomes);

    Ok(host_totals.iter().map(|(_, count)| count).sum())
}

/// Run one plugin instance to completion. Failures are contained: they are
/// logged and reported as zero rows.
fn run_plugin(job: &PluginJob, temp_root: &Path, lock: Option<Arc<Mutex<()>>>) -> PluginOutcome {
    let rows = build_and_run(job, temp_root, lock).unwrap_or_else(|e| {
        error!(
            "Plugin {} failed for host {}: {:#}",
            job.config.plugin_name, job.hostname, e
        );
        0
    });
    PluginOutcome {
        hostname: job.hostname.clone(),
        plugin_name: job.config.plugin_name.clone(),
        rows,
    }
}

fn build_and_run(job: &PluginJob, temp_root: &Path, lock: Option<Arc<Mutex<()>>>) -> Result<u64> {
    let mut reader = plugins::build_reader(&job.config.plugin_name).ok_or_else(|| {
        anyhow::anyhow!("no registered plugin named {}", job.config.plugin_name)
    })?;
    let runtime = PluginRuntime::new(job.config.clone(), &job.hostname, temp_root, lock)?;
    runtime.run(reader.as_mut(), &job.orc_paths, temp_root)
}

fn merge_host(task: &HostTask, temp_root: &Path) -> (String, u64) {
    let count = merge_timelines_for_host(&task.hostname, temp_root, &task.output_path)
        .unwrap_or_else(|e| {
            error!("Merge failed for host {}: {:#}", task.hostname, e);
            0
        });
    (task.hostname.clone(), count)
}

/// Final summary: per host per plugin row counts, per-host totals after
/// deduplication, grand total.
fn print_summaries(host_totals: &[(String, u64)], outcomes: &[PluginOutcome]) {
    info!("== Printing final summary of generated timelines:");
    let mut hosts: Vec<&str> = host_totals.iter().map(|(h, _)| h.as_str()).collect();
    hosts.sort_unstable();
    hosts.dedup();

    for host in hosts {
        let total = host_totals
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, c)| *c)
            .unwrap_or(0);
        info!("=======================================================================");
        info!("====== Hostname: {} - {} events", host, total);

        let mut plugin_names: Vec<&str> = outcomes
            .iter()
            .filter(|o| o.hostname == host)
            .map(|o| o.plugin_name.as_str())
            .collect();
        plugin_names.sort_unstable();
        plugin_names.dedup();

        for plugin in plugin_names {
            let rows: u64 = outcomes
                .iter()
                .filter(|o| o.hostname == host && o.plugin_name == plugin)
                .map(|o| o.rows)
                .sum();
            info!("========== {} {} {}", host, plugin, rows);
        }
        info!("====== Total for {}: {}", host, total);
    }

    let grand_total: u64 = host_totals.iter().map(|(_, c)| c).sum();
    info!("=======================================================================");
    info!("====== Total: {} events processed", grand_total);
    info!("=======================================================================");
}
