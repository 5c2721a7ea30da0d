//! Content fingerprints of everything that produces a fixture database.
//!
//! Two hashes decide whether a database is still valid:
//!
//! - the *source files hash* covers the bytes of every configured hash path,
//!   every migration file and every pre-migration import, plus the database
//!   name prefix. Only content counts, never modification times, so a fresh
//!   checkout of the same tree fingerprints identically.
//! - the *scenario hash* covers how the database is built (import list,
//!   migrations setting, seeder list) independent of file content.
//!
//! Snapshot files use the scenario hash of the seeder subset they contain.
//! Results are memoised in an [`EngineCache`].

pub mod hasher;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::EngineCache;
pub use hasher::{hash_to_hex, Hash, Hasher};

/// Characters of the source files hash kept in names.
pub const SOURCE_HASH_LENGTH: usize = 6;
/// Characters of the scenario/snapshot hash kept in names.
pub const SCENARIO_HASH_LENGTH: usize = 12;

#[derive(thiserror::Error, Debug)]
pub enum FingerprintError {
    #[error("hash path does not exist: {0}")]
    HashPathMissing(PathBuf),

    #[error("pre-migration import file does not exist: {0}")]
    ImportPathMissing(PathBuf),

    #[error("pre-migration import must be a file, but {0} is a directory")]
    ImportPathIsDirectory(PathBuf),

    #[error("migrations path does not exist: {0}")]
    MigrationsPathMissing(PathBuf),

    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What a fingerprint is computed from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintSettings {
    /// Base directory for relative paths.
    pub project_root: PathBuf,
    /// Database name prefix, folded into the source files hash.
    pub prefix: String,
    /// Extra files or directories whose content invalidates fixtures.
    pub hash_paths: Vec<PathBuf>,
    /// SQL files imported before migrations, in order.
    pub imports: Vec<PathBuf>,
    /// Migrations directory; `None` when migrations are not run.
    pub migrations: Option<PathBuf>,
    /// When false, file content is not hashed at all.
    pub check_for_source_changes: bool,
}

#[derive(Serialize)]
struct ScenarioKey<'a> {
    imports: Vec<String>,
    migrations: Option<String>,
    seeders: &'a [String],
}

/// Computes the hashes for one build configuration.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    settings: FingerprintSettings,
    hasher: Hasher,
}

impl Fingerprinter {
    #[must_use]
    pub fn new(settings: FingerprintSettings) -> Self {
        Self {
            settings,
            hasher: Hasher::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &FingerprintSettings {
        &self.settings
    }

    /// `path` resolved against the project root.
    #[must_use]
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.settings.project_root.join(path)
        }
    }

    /// Fail on any configured path that is missing or of the wrong kind.
    pub fn validate(&self) -> Result<(), FingerprintError> {
        for path in &self.settings.hash_paths {
            if !self.resolve_path(path).exists() {
                return Err(FingerprintError::HashPathMissing(path.clone()));
            }
        }
        for path in &self.settings.imports {
            let resolved = self.resolve_path(path);
            if resolved.is_dir() {
                return Err(FingerprintError::ImportPathIsDirectory(path.clone()));
            }
            if !resolved.is_file() {
                return Err(FingerprintError::ImportPathMissing(path.clone()));
            }
        }
        if let Some(path) = &self.settings.migrations {
            if !self.resolve_path(path).exists() {
                return Err(FingerprintError::MigrationsPathMissing(path.clone()));
            }
        }
        Ok(())
    }

    /// Memoised [`Self::compute_source_files_hash`].
    pub fn source_files_hash(&self, cache: &mut EngineCache) -> Result<String, FingerprintError> {
        let key = memo_key(&self.settings);
        if let Some(hash) = cache.source_hash(&key) {
            return Ok(hash.to_string());
        }
        let hash = self.compute_source_files_hash()?;
        cache.remember_source_hash(key, hash.clone());
        Ok(hash)
    }

    /// Hash of the prefix and the content of every input file.
    pub fn compute_source_files_hash(&self) -> Result<String, FingerprintError> {
        self.validate()?;

        let mut digest = blake3::Hasher::new();
        digest.update(self.settings.prefix.as_bytes());
        digest.update(b"\n");

        if !self.settings.check_for_source_changes {
            return Ok(digest.finalize().to_hex().to_string());
        }

        let mut roots: Vec<PathBuf> = self.settings.hash_paths.clone();
        roots.extend(self.settings.migrations.iter().cloned());
        roots.extend(self.settings.imports.iter().cloned());

        let mut entries: Vec<(String, String)> = Vec::new();
        for root in &roots {
            let resolved = self.resolve_path(root);
            let files = hasher::collect_files(&resolved).map_err(|source| FingerprintError::Io {
                path: resolved.clone(),
                source,
            })?;
            for file in files {
                let hash = self
                    .hasher
                    .full_hash(&file)
                    .map_err(|source| FingerprintError::Io {
                        path: file.clone(),
                        source,
                    })?;
                entries.push((self.relative_name(&file), hash_to_hex(&hash)));
            }
        }
        entries.sort();
        entries.dedup();

        for (path, hash) in &entries {
            digest.update(path.as_bytes());
            digest.update(b"\0");
            digest.update(hash.as_bytes());
            digest.update(b"\n");
        }
        log::debug!("Fingerprinted {} source file(s)", entries.len());
        Ok(digest.finalize().to_hex().to_string())
    }

    fn relative_name(&self, file: &Path) -> String {
        let relative = file
            .strip_prefix(&self.settings.project_root)
            .unwrap_or(file);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Hash of the build recipe: imports, migrations setting and seeders.
    #[must_use]
    pub fn scenario_hash(&self, seeders: &[String]) -> String {
        let key = ScenarioKey {
            imports: self
                .settings
                .imports
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            migrations: self
                .settings
                .migrations
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            seeders,
        };
        // Serializing plain strings cannot fail.
        let json = serde_json::to_vec(&key).unwrap_or_default();
        blake3::hash(&json).to_hex().to_string()
    }

    /// Memoised [`Self::scenario_hash`].
    pub fn cached_scenario_hash(&self, cache: &mut EngineCache, seeders: &[String]) -> String {
        let key = format!("{}|{}", memo_key(&self.settings), seeders.join("\u{1f}"));
        if let Some(hash) = cache.scenario_hash(&key) {
            return hash.to_string();
        }
        let hash = self.scenario_hash(seeders);
        cache.remember_scenario_hash(key, hash.clone());
        hash
    }

    /// Hash identifying a snapshot that contains `seeders`.
    #[must_use]
    pub fn snapshot_hash(&self, seeders: &[String]) -> String {
        self.scenario_hash(seeders)
    }
}

fn memo_key(settings: &FingerprintSettings) -> String {
    serde_json::to_string(settings).unwrap_or_else(|_| format!("{settings:?}"))
}

fn truncated(hash: &str, len: usize) -> &str {
    hash.get(..len).unwrap_or(hash)
}

/// `{prefix}{original}[_{modifier}]_{source6}-{scenario12}`.
#[must_use]
pub fn database_name(
    prefix: &str,
    original: &str,
    modifier: Option<&str>,
    source_hash: &str,
    scenario_hash: &str,
) -> String {
    let modifier = modifier
        .filter(|m| !m.is_empty())
        .map(|m| format!("_{m}"))
        .unwrap_or_default();
    format!(
        "{prefix}{original}{modifier}_{}-{}",
        truncated(source_hash, SOURCE_HASH_LENGTH),
        truncated(scenario_hash, SCENARIO_HASH_LENGTH)
    )
}

/// The source hash fragment encoded in a scenario database name, when the
/// name looks like one of ours.
#[must_use]
pub fn database_source_fragment<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    let rest = name.strip_prefix(prefix)?;
    let (_, hashes) = rest.rsplit_once('_')?;
    let (source, scenario) = hashes.split_once('-')?;
    (is_hex(source, SOURCE_HASH_LENGTH) && is_hex(scenario, SCENARIO_HASH_LENGTH)).then_some(source)
}

/// `{prefix}{original}.{source6}-{snapshot12}.{ext}`.
#[must_use]
pub fn snapshot_file_name(
    prefix: &str,
    original: &str,
    source_hash: &str,
    snapshot_hash: &str,
    extension: &str,
) -> String {
    format!(
        "{prefix}{original}.{}-{}.{extension}",
        truncated(source_hash, SOURCE_HASH_LENGTH),
        truncated(snapshot_hash, SCENARIO_HASH_LENGTH)
    )
}

/// The parts of a snapshot file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub original: String,
    pub source: String,
    pub snapshot: String,
    pub extension: String,
}

/// Parse a snapshot file name produced by [`snapshot_file_name`].
#[must_use]
pub fn parse_snapshot_file_name(prefix: &str, file_name: &str) -> Option<SnapshotName> {
    let rest = file_name.strip_prefix(prefix)?;
    let (stem, extension) = rest.rsplit_once('.')?;
    let (original, hashes) = stem.rsplit_once('.')?;
    let (source, snapshot) = hashes.split_once('-')?;
    if original.is_empty()
        || !is_hex(source, SOURCE_HASH_LENGTH)
        || !is_hex(snapshot, SCENARIO_HASH_LENGTH)
    {
        return None;
    }
    Some(SnapshotName {
        original: original.to_string(),
        source: source.to_string(),
        snapshot: snapshot.to_string(),
        extension: extension.to_string(),
    })
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}
