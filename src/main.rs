//! Orc Timeline - turn DFIR-ORC forensic archives into per-host timelines.
//!
//! Extracts artifacts out of nested 7z collections, converts them to events
//! through per-artifact readers, external-sorts everything and merges one
//! deduplicated csv.gz timeline per host.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orc_timeline::cli::{Cli, Commands, ProcessArgs, ProcessDirArgs};
use orc_timeline::config::Config;
use orc_timeline::core::{self, CoreError, ORC_REGEX};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli);

    if let Some(tmp_dir) = &cli.tmp_dir {
        // tempfile resolves the scratch root through the environment.
        std::env::set_var("TMPDIR", tmp_dir);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(CoreError::DuplicateHostnames(_)) = e.downcast_ref::<CoreError>() {
                // Diagnostics were already logged at critical level.
                return ExitCode::from(2);
            }
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Process(args) => cmd_process(&cli, args.clone()),
        Commands::ProcessDir(args) => cmd_process_dir(&cli, args.clone()),
        Commands::ShowConfFile => {
            let config = Config::load(cli.config.as_deref())?;
            println!("Configuration file is located at the following path:");
            println!("{}", config.path.display());
            Ok(())
        }
        Commands::ShowConf => {
            let config = Config::load(cli.config.as_deref())?;
            println!("Configuration file content:");
            println!("=======================================================================");
            print!("{}", std::fs::read_to_string(&config.path)?);
            println!("=======================================================================");
            Ok(())
        }
        Commands::InitConf => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            Config::write_default(&path)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

fn cmd_process(cli: &Cli, args: ProcessArgs) -> Result<()> {
    let mut paths = args.paths;
    let output_path = paths.pop().expect("clap enforces at least two paths");
    let file_list = paths;

    let parent = output_parent(&output_path);
    if !parent.is_dir() {
        bail!(
            "'OUTPUT_PATH': Directory '{}' does not exist or is not a directory.",
            parent.display()
        );
    }
    if output_path.exists() && !args.overwrite {
        bail!(
            "'OUTPUT_PATH': File '{}' already exists, use '--overwrite' if you know what you are doing.",
            output_path.display()
        );
    }

    let jobs = resolve_jobs(args.jobs);
    let config = Config::load(cli.config.as_deref())?;

    let mut hostnames = BTreeSet::new();
    let mut clean_file_list = Vec::new();
    for file in &file_list {
        if !file.is_file() {
            bail!("'FILES': File '{}' does not exist.", file.display());
        }
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match core::hostname_from_archive(&name) {
            Some(hostname) => {
                hostnames.insert(hostname);
                clean_file_list.push(file.clone());
            }
            None => info!(
                "Impossible to extract hostname from filename '{}', file will be ignored. \
                 Tip: filename must match regex '{}'",
                file.display(),
                ORC_REGEX
            ),
        }
    }

    if hostnames.len() != 1 {
        bail!(
            "Bad file list, all files must belong to the same host. Parsed hosts: {:?}",
            hostnames
        );
    }
    let hostname = hostnames.into_iter().next().expect("one hostname");

    core::process(clean_file_list, &output_path, &hostname, jobs, &config)?;
    Ok(())
}

fn cmd_process_dir(cli: &Cli, args: ProcessDirArgs) -> Result<()> {
    if !args.input_dir.is_dir() {
        bail!(
            "'INPUT_DIR': Directory '{}' does not exist or is a file.",
            args.input_dir.display()
        );
    }
    if !args.output_dir.is_dir() {
        bail!(
            "'OUTPUT_DIR': Directory '{}' does not exist or is a file.",
            args.output_dir.display()
        );
    }

    let jobs = resolve_jobs(args.jobs);
    let config = Config::load(cli.config.as_deref())?;

    let tasks = core::host_tasks_from_dir(&args.input_dir, &args.output_dir);
    let tasks = core::filter_existing_outputs(tasks, args.overwrite)?;

    core::process_dir(tasks, jobs, &config)?;
    Ok(())
}

/// `-1` is the "not given" sentinel: warn and fall back to one worker.
fn resolve_jobs(jobs: i32) -> usize {
    if jobs == -1 {
        warn!(
            "--jobs option was not given, thus only one thread will be used. \
             Therefore processing could take a while."
        );
        return 1;
    }
    jobs.max(1) as usize
}

/// Console logging at the configured level; the optional log file always
/// captures DEBUG and above.
fn init_logging(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(EnvFilter::new(cli.log_level.directive()));

    if let Some(log_file) = &cli.log_file {
        match std::fs::File::create(log_file) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                tracing_subscriber::registry()
                    .with(console_layer)
                    .with(
                        fmt::layer()
                            .with_target(false)
                            .with_ansi(false)
                            .with_writer(writer)
                            .with_filter(LevelFilter::DEBUG),
                    )
                    .init();
                return Some(guard);
            }
            Err(e) => {
                eprintln!("unable to open log file {}: {}", log_file.display(), e);
            }
        }
    }

    tracing_subscriber::registry().with(console_layer).init();
    None
}

fn output_parent(output_path: &Path) -> PathBuf {
    match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
