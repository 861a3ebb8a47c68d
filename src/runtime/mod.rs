//! Plugin Runtime - stages artifacts out of ORC archives and funnels
//! reader events into sorted run files.
//!
//! All scaffolding that is common to every plugin lives here: archive
//! staging, the GetThis original-path map, the magic-number filter, the
//! artifact walk, and the skip/rollback error policy. The only operation
//! that differs between plugins is [`ArtifactReader::parse_artifact`].

pub mod chunk;
pub mod event;

pub use chunk::{ChunkWriter, SortedChunk, CHUNK_CAPACITY};
pub use event::Event;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use crate::archive;
use crate::config::PluginConfig;

/// Directory inside a plugin's scratch tree collecting the artifacts that
/// matched the member pattern, across all archives and sub-archives.
const EXTRACTION_DIR: &str = "all_extraction";

/// Parses one kind of staged artifact into a stream of events.
///
/// Readers are stateless between hosts: one instance is built per plugin
/// instance. A failure inside a single artifact is caught by the runtime,
/// logged at warning level and the artifact is skipped.
pub trait ArtifactReader: Send {
    /// Magic-number prefix staged files must start with; staged files that
    /// do not match are deleted before parsing.
    fn file_header(&self) -> Option<&[u8]> {
        None
    }

    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()>;
}

/// Everything a reader may touch while parsing one artifact.
pub struct PluginContext<'a> {
    writer: &'a mut ChunkWriter,
    original_paths: &'a HashMap<String, String>,
    scratch_root: &'a Path,
    hostname: &'a str,
    lock: Option<&'a Arc<Mutex<()>>>,
}

impl PluginContext<'_> {
    /// Funnel one event into the sorted chunk.
    pub fn add_event(&mut self, event: Event) -> Result<()> {
        self.writer.add_event(&event)
    }

    pub fn hostname(&self) -> &str {
        self.hostname
    }

    /// Original on-disk path recorded by the collection tool for a staged
    /// artifact, falling back to the staged path relative to the scratch
    /// directory.
    pub fn original_path(&self, artifact: &Path) -> String {
        let basename = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(original) = self.original_paths.get(&basename) {
            return original.clone();
        }
        artifact
            .strip_prefix(self.scratch_root)
            .unwrap_or(artifact)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Discard everything emitted for the current artifact so it can be
    /// reprocessed from scratch.
    pub fn rollback(&mut self) -> Result<()> {
        self.writer.rollback()
    }

    /// Coarse advisory lock serializing non-reentrant readers across the
    /// worker pool; absent when running single-threaded.
    pub fn advisory_lock(&self) -> Option<&Arc<Mutex<()>>> {
        self.lock
    }
}

#[cfg(test)]
impl<'a> PluginContext<'a> {
    pub(crate) fn for_tests(
        writer: &'a mut ChunkWriter,
        original_paths: &'a HashMap<String, String>,
        scratch_root: &'a Path,
    ) -> Self {
        Self {
            writer,
            original_paths,
            scratch_root,
            hostname: "HOST",
            lock: None,
        }
    }
}

/// One plugin instance: owns its scratch directory and its run-file list
/// for the lifetime of the run.
pub struct PluginRuntime {
    config: PluginConfig,
    hostname: String,
    scratch: TempDir,
    original_paths: HashMap<String, String>,
    sub_archive_counter: u32,
    lock: Option<Arc<Mutex<()>>>,
}

impl PluginRuntime {
    pub fn new(
        config: PluginConfig,
        hostname: &str,
        temp_root: &Path,
        lock: Option<Arc<Mutex<()>>>,
    ) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("orc_timeline_{}_", config.plugin_name))
            .tempdir_in(temp_root)
            .context("unable to create plugin scratch directory")?;
        Ok(Self {
            config,
            hostname: hostname.to_string(),
            scratch,
            original_paths: HashMap::new(),
            sub_archive_counter: 0,
            lock,
        })
    }

    /// Stage matching artifacts, run the reader over each of them, and
    /// return the number of rows written across all run files. The scratch
    /// directory is removed on every exit path.
    pub fn run(
        mut self,
        reader: &mut dyn ArtifactReader,
        orc_paths: &[PathBuf],
        temp_root: &Path,
    ) -> Result<u64> {
        debug!("{} started", self.config.plugin_name);
        let mut writer = ChunkWriter::new(
            temp_root,
            &self.hostname,
            &self.config.plugin_name,
            &self.config.sourcetype,
        );

        self.stage_archives(orc_paths);
        self.filter_by_magic(reader.file_header());
        self.parse_all_artifacts(reader, &mut writer)?;

        let rows = writer.finish()?;
        debug!("{} ended", self.config.plugin_name);
        Ok(rows)
    }

    /// Pairs of (archive path, archive tag) where the tag is a configured
    /// substring of the archive's basename.
    fn relevant_archives(&self, orc_paths: &[PathBuf]) -> Vec<(PathBuf, String)> {
        let mut pairs = Vec::new();
        for orc in orc_paths {
            let basename = orc
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for tag in &self.config.archives {
                if basename.contains(tag.as_str()) {
                    pairs.push((orc.clone(), tag.clone()));
                }
            }
        }
        pairs
    }

    /// Deflate matching members out of every relevant archive. A failure on
    /// one archive abandons that archive only.
    fn stage_archives(&mut self, orc_paths: &[PathBuf]) {
        for (orc, tag) in self.relevant_archives(orc_paths) {
            let tag_dir = self.scratch.path().join(&tag);
            let extraction_dir = tag_dir.join(EXTRACTION_DIR);
            if let Err(e) = fs::create_dir_all(&extraction_dir) {
                error!(
                    "Unable to prepare extraction directory for {}: {}",
                    orc.display(),
                    e
                );
                continue;
            }

            if self.config.sub_archives.is_empty() {
                if let Err(e) =
                    archive::extract_matching(&orc, &extraction_dir, &self.config.match_pattern)
                {
                    error!("Unable to open {} archive. Error: {:#}", orc.display(), e);
                }
                continue;
            }

            for sub_archive in self.config.sub_archives.clone() {
                if let Err(e) =
                    self.stage_sub_archive(&orc, &tag_dir, &extraction_dir, &sub_archive)
                {
                    let mut msg = format!(
                        "Unable to deflate {} from {}. Error: {:#}",
                        sub_archive,
                        orc.display(),
                        e
                    );
                    if format!("{e:#}").contains("Invalid argument") {
                        msg.push_str(" (this may happen when compressed file is empty)");
                    }
                    error!("{msg}");
                }
            }
        }
    }

    /// Materialize one nested sub-archive, ingest its GetThis manifest and
    /// extract its matching members into the shared extraction directory.
    /// The sub-archive scratch subtree is removed afterwards in all cases.
    fn stage_sub_archive(
        &mut self,
        orc: &Path,
        tag_dir: &Path,
        extraction_dir: &Path,
        sub_archive: &str,
    ) -> Result<()> {
        self.sub_archive_counter += 1;
        let sub_dir = tag_dir.join(format!("{}_{}", sub_archive, self.sub_archive_counter));

        let result = (|| -> Result<()> {
            archive::extract_nested(orc, &sub_dir, sub_archive)?;
            for inner in find_files_named(&sub_dir, sub_archive) {
                archive::extract_getthis(&inner, extraction_dir)?;
                let manifest = extraction_dir.join(archive::GETTHIS_MANIFEST);
                if manifest.exists() {
                    if let Err(e) = archive::parse_getthis(&manifest, &mut self.original_paths) {
                        debug!("{e:#}");
                    }
                    let _ = fs::remove_file(&manifest);
                }
                archive::extract_matching(&inner, extraction_dir, &self.config.match_pattern)?;
            }
            Ok(())
        })();

        if sub_dir.exists() {
            let _ = fs::remove_dir_all(&sub_dir);
        }
        result
    }

    /// Delete staged files whose first bytes do not match the plugin's
    /// declared magic number.
    fn filter_by_magic(&self, header: Option<&[u8]>) {
        let Some(header) = header else { return };
        if header.is_empty() {
            return;
        }
        for artifact in self.staged_artifacts() {
            let mut prefix = vec![0u8; header.len()];
            let matches = File::open(&artifact)
                .and_then(|mut f| f.read_exact(&mut prefix))
                .map(|_| prefix == header)
                .unwrap_or(false);
            if !matches {
                let _ = fs::remove_file(&artifact);
            }
        }
    }

    /// Regular files under any `all_extraction` directory, in deterministic
    /// order so that run output does not depend on directory enumeration.
    fn staged_artifacts(&self) -> Vec<PathBuf> {
        WalkDir::new(self.scratch.path())
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .components()
                    .any(|c| c.as_os_str() == EXTRACTION_DIR)
            })
            .map(|e| e.into_path())
            .collect()
    }

    fn parse_all_artifacts(
        &self,
        reader: &mut dyn ArtifactReader,
        writer: &mut ChunkWriter,
    ) -> Result<()> {
        for artifact in self.staged_artifacts() {
            debug!(
                "[{}] [{}] parsing: {}",
                self.hostname,
                archive_tag_of(&artifact),
                artifact
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            );
            writer.artifact_boundary()?;
            let mut ctx = PluginContext {
                writer: &mut *writer,
                original_paths: &self.original_paths,
                scratch_root: self.scratch.path(),
                hostname: &self.hostname,
                lock: self.lock.as_ref(),
            };
            if let Err(e) = reader.parse_artifact(&mut ctx, &artifact) {
                warn!("Error while parsing {}: {:#}", artifact.display(), e);
            }
        }
        Ok(())
    }
}

/// Archive tag an artifact was staged from, for log messages only.
fn archive_tag_of(artifact: &Path) -> String {
    let components: Vec<_> = artifact.components().collect();
    for window in components.windows(2) {
        if window[1].as_os_str() == EXTRACTION_DIR {
            return window[0].as_os_str().to_string_lossy().into_owned();
        }
    }
    "unknown".to_string()
}

/// Files named exactly `name` anywhere under `root`.
fn find_files_named(root: &Path, name: &str) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy() == name)
        .map(|e| e.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn test_config(name: &str) -> PluginConfig {
        let yaml = format!(
            r#"
Plugins:
  - {name}:
      archives: ["General", "Little"]
      match_pattern: ".*\\.csv$"
      sourcetype: "Test"
"#
        );
        Config::from_str(&yaml, PathBuf::from("test.yaml"))
            .unwrap()
            .plugin_configs
            .remove(0)
    }

    struct CountingReader {
        parsed: Vec<PathBuf>,
    }

    impl ArtifactReader for CountingReader {
        fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
            self.parsed.push(artifact.to_path_buf());
            ctx.add_event(Event {
                timestamp: Some(event::epoch()),
                description: format!("parsed {}", artifact.display()),
                source: ctx.original_path(artifact),
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_relevant_archives_matches_substring_tags() {
        let temp = tempdir().unwrap();
        let runtime = PluginRuntime::new(
            test_config("NTFSInfoToTimeline"),
            "HOST",
            temp.path(),
            None,
        )
        .unwrap();

        let paths = vec![
            PathBuf::from("/data/ORC_Server_HOST_General.7z"),
            PathBuf::from("/data/ORC_Server_HOST_Little.7z"),
            PathBuf::from("/data/ORC_Server_HOST_Browsers.7z"),
        ];
        let pairs = runtime.relevant_archives(&paths);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].1, "General");
        assert_eq!(pairs[1].1, "Little");
    }

    #[test]
    fn test_parse_all_artifacts_walks_extraction_dir() {
        let temp = tempdir().unwrap();
        let runtime = PluginRuntime::new(
            test_config("NTFSInfoToTimeline"),
            "HOST",
            temp.path(),
            None,
        )
        .unwrap();

        let extraction = runtime.scratch.path().join("General").join(EXTRACTION_DIR);
        fs::create_dir_all(&extraction).unwrap();
        fs::write(extraction.join("b.csv"), "data").unwrap();
        fs::write(extraction.join("a.csv"), "data").unwrap();
        // Files outside all_extraction are not artifacts.
        fs::write(runtime.scratch.path().join("stray.csv"), "data").unwrap();

        let mut reader = CountingReader { parsed: Vec::new() };
        let mut writer = ChunkWriter::new(temp.path(), "HOST", "NTFSInfoToTimeline", "Test");
        runtime.parse_all_artifacts(&mut reader, &mut writer).unwrap();

        assert_eq!(reader.parsed.len(), 2);
        assert!(reader.parsed[0].ends_with("a.csv"));
        assert_eq!(writer.finish().unwrap(), 2);
    }

    #[test]
    fn test_filter_by_magic_deletes_mismatches() {
        let temp = tempdir().unwrap();
        let runtime = PluginRuntime::new(
            test_config("RegistryToTimeline"),
            "HOST",
            temp.path(),
            None,
        )
        .unwrap();

        let extraction = runtime.scratch.path().join("Little").join(EXTRACTION_DIR);
        fs::create_dir_all(&extraction).unwrap();
        let hive = extraction.join("SYSTEM_data.csv");
        let junk = extraction.join("junk.csv");
        let short = extraction.join("short.csv");
        fs::write(&hive, b"regf-and-more").unwrap();
        fs::write(&junk, b"MZ\x90\x00").unwrap();
        fs::write(&short, b"re").unwrap();

        runtime.filter_by_magic(Some(b"regf"));

        assert!(hive.exists());
        assert!(!junk.exists());
        assert!(!short.exists());
    }

    #[test]
    fn test_original_path_fallback() {
        let temp = tempdir().unwrap();
        let runtime = PluginRuntime::new(
            test_config("NTFSInfoToTimeline"),
            "HOST",
            temp.path(),
            None,
        )
        .unwrap();

        let mut originals = HashMap::new();
        originals.insert(
            "SAM_data".to_string(),
            "C:\\Windows\\System32\\config\\SAM".to_string(),
        );
        let mut writer = ChunkWriter::new(temp.path(), "HOST", "NTFSInfoToTimeline", "Test");
        let ctx = PluginContext {
            writer: &mut writer,
            original_paths: &originals,
            scratch_root: runtime.scratch.path(),
            hostname: "HOST",
            lock: None,
        };

        let mapped = ctx.original_path(&runtime.scratch.path().join("General/all_extraction/SAM_data"));
        assert_eq!(mapped, "C:\\Windows\\System32\\config\\SAM");

        let fallback =
            ctx.original_path(&runtime.scratch.path().join("General/all_extraction/other"));
        assert_eq!(fallback, "General/all_extraction/other");
    }

    #[test]
    fn test_archive_tag_of() {
        assert_eq!(
            archive_tag_of(Path::new("/tmp/scratch/General/all_extraction/file")),
            "General"
        );
        assert_eq!(archive_tag_of(Path::new("/tmp/noextract/file")), "unknown");
    }
}
