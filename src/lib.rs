//! Orc Timeline Library
//!
//! Turns collections of DFIR-ORC forensic archives into one deduplicated,
//! chronologically sorted timeline per host, written as gzip-compressed CSV.
//!
//! # Pipeline
//!
//! - **Staging**: relevant members of the (possibly nested) 7z archives are
//!   extracted into a per-plugin scratch directory
//! - **Event generation**: each staged artifact is fed to its artifact
//!   reader, which emits timestamped events
//! - **External sort**: events are buffered in bounded sorted chunks and
//!   spilled to locally-sorted run files
//! - **Merge**: all run files of a host are k-way merged, deduplicated and
//!   compressed into the final timeline
//!
//! # Example
//!
//! ```no_run
//! use orc_timeline::config::Config;
//! use orc_timeline::core;
//! use std::path::{Path, PathBuf};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let files = vec![PathBuf::from("ORC_Server_MACHINE_General.7z")];
//!     let total = core::process(files, Path::new("MACHINE.csv.gz"), "MACHINE", 1, &config)?;
//!     println!("{} events", total);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod cli;
pub mod config;
pub mod core;
pub mod plugins;
pub mod runtime;

// Re-export commonly used types
pub use config::{Config, ConfigError, PluginConfig};
pub use core::{CoreError, HostTask};
pub use runtime::{ArtifactReader, ChunkWriter, Event, PluginContext, PluginRuntime};
