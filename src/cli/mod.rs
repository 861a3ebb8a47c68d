//! CLI module - Command line interface definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Orc Timeline - create per-host forensic timelines from DFIR-ORC archives
///
/// Extracts artifacts out of nested 7z collections, converts them to events
/// and merges everything into one sorted, deduplicated csv.gz per host.
#[derive(Parser, Debug)]
#[command(name = "orc-timeline")]
#[command(author = "Ryan Cashmoney <tunclon@proton.me>")]
#[command(version)]
#[command(about = "Turn DFIR-ORC archives into per-host forensic timelines", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory where to write temporary files into (TMPDIR is honored too)
    #[arg(long, global = true)]
    pub tmp_dir: Option<PathBuf>,

    /// Print log messages of this level and higher
    #[arg(long, value_enum, global = true, default_value = "info")]
    pub log_level: LogLevel,

    /// Log file storing DEBUG level messages regardless of --log-level
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Path to the plugin configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a timeline for one host from a list of ORC archives
    Process(ProcessArgs),

    /// Process every ORC archive found under a directory, one output per host
    #[command(alias = "process_dir")]
    ProcessDir(ProcessDirArgs),

    /// Show path to the configuration file
    ShowConfFile,

    /// Show the configuration file content
    ShowConf,

    /// Write the built-in default configuration to the default path
    InitConf,
}

#[derive(Debug, Clone, Parser)]
pub struct ProcessArgs {
    /// ORC archives of one host, followed by the output timeline path
    #[arg(required = true, num_args = 2.., value_name = "FILES... OUTPUT_PATH")]
    pub paths: Vec<PathBuf>,

    /// Number of parallel workers
    #[arg(long, short, default_value_t = -1, allow_hyphen_values = true)]
    pub jobs: i32,

    /// Overwrite destination file if it already exists
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct ProcessDirArgs {
    /// Directory crawled recursively for ORC archives
    #[arg(required = true)]
    pub input_dir: PathBuf,

    /// Directory where the per-host timelines are written
    #[arg(required = true)]
    pub output_dir: PathBuf,

    /// Number of parallel workers
    #[arg(long, short, default_value_t = -1, allow_hyphen_values = true)]
    pub jobs: i32,

    /// Overwrite destination files if they already exist
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Critical errors only
    Critical,
    /// Errors and above
    Error,
    /// Warnings and above
    Warning,
    /// Informational messages (default)
    Info,
    /// Everything, including per-artifact traces
    Debug,
}

impl LogLevel {
    /// Directive understood by the tracing env-filter. Critical folds into
    /// error, tracing has no level above it.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Critical | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_process() {
        let cli = Cli::try_parse_from([
            "orc-timeline",
            "process",
            "-j",
            "4",
            "ORC_Server_HOST_General.7z",
            "out.csv.gz",
        ])
        .unwrap();
        match cli.command {
            Commands::Process(args) => {
                assert_eq!(args.jobs, 4);
                assert_eq!(args.paths.len(), 2);
                assert!(!args.overwrite);
            }
            _ => panic!("expected process subcommand"),
        }
    }

    #[test]
    fn test_cli_jobs_sentinel_default() {
        let cli = Cli::try_parse_from(["orc-timeline", "process-dir", "in", "out"]).unwrap();
        match cli.command {
            Commands::ProcessDir(args) => assert_eq!(args.jobs, -1),
            _ => panic!("expected process-dir subcommand"),
        }
    }

    #[test]
    fn test_process_requires_two_paths() {
        let result = Cli::try_parse_from(["orc-timeline", "process", "only_one"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_level_directives() {
        assert_eq!(LogLevel::Critical.directive(), "error");
        assert_eq!(LogLevel::Warning.directive(), "warn");
        assert_eq!(LogLevel::Debug.directive(), "debug");
    }
}
