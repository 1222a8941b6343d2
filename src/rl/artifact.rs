// src/rl/artifact.rs
//
// Persisted policy artifact: every intersection's Q-table in one JSON file.
//
// {
//   "format_version": 1,
//   "tables": { "J7": [ {"state": [0,1,0,0], "values": [-1.2, -0.8]}, ... ], ... }
// }
//
// Training writes it once at the end; the runtime loads it once at start and
// never mutates it afterwards.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::q_table::{total_states, QTable, QTableSet};

/// Current artifact schema version.
pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyArtifact {
    pub format_version: u32,
    pub tables: QTableSet,
}

#[derive(Debug)]
pub enum ArtifactError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Version { path: PathBuf, found: u32 },
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactError::Io { path, source } => {
                write!(f, "policy artifact I/O error at '{}': {}", path.display(), source)
            }
            ArtifactError::Parse { path, source } => {
                write!(f, "failed to parse policy artifact '{}': {}", path.display(), source)
            }
            ArtifactError::Version { path, found } => write!(
                f,
                "policy artifact '{}' has format_version {}, expected {}",
                path.display(),
                found,
                ARTIFACT_VERSION
            ),
        }
    }
}

impl std::error::Error for ArtifactError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArtifactError::Io { source, .. } => Some(source),
            ArtifactError::Parse { source, .. } => Some(source),
            ArtifactError::Version { .. } => None,
        }
    }
}

impl PolicyArtifact {
    pub fn new(tables: QTableSet) -> Self {
        Self {
            format_version: ARTIFACT_VERSION,
            tables,
        }
    }

    /// Write the artifact, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let io_err = |source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let payload = serde_json::to_vec_pretty(self).map_err(|source| ArtifactError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, payload).map_err(io_err)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let bytes = fs::read(path).map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let artifact: PolicyArtifact =
            serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if artifact.format_version != ARTIFACT_VERSION {
            return Err(ArtifactError::Version {
                path: path.to_path_buf(),
                found: artifact.format_version,
            });
        }
        Ok(artifact)
    }

    /// Load the artifact, degrading to an empty table set on any error.
    ///
    /// With no tables every runtime decision goes through the fallback layers.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(artifact) => {
                eprintln!(
                    "[artifact] loaded {} tables ({} states) from {}",
                    artifact.tables.len(),
                    total_states(&artifact.tables),
                    path.display()
                );
                artifact
            }
            Err(err) => {
                eprintln!("[artifact] WARN: {err}; using empty policy tables");
                Self::new(QTableSet::new())
            }
        }
    }

    /// Table for one intersection; an empty table if the artifact has none.
    pub fn table_for(&self, tls_id: &str) -> QTable {
        match self.tables.get(tls_id) {
            Some(table) => table.clone(),
            None => {
                eprintln!("[artifact] WARN: no table for {tls_id}; using fallback policy only");
                QTable::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionValues, DiscretizedState};

    #[test]
    fn round_trip_preserves_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("q.json");

        let mut t = QTable::new();
        t.insert(DiscretizedState::new([1, 0, 2, 0]), ActionValues([0.1, -0.3]));
        let mut tables = QTableSet::new();
        tables.insert("J7".to_string(), t);

        let artifact = PolicyArtifact::new(tables);
        artifact.save(&path).unwrap();
        let loaded = PolicyArtifact::load(&path).unwrap();
        assert_eq!(loaded, artifact);
    }

    #[test]
    fn missing_or_corrupt_artifact_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            PolicyArtifact::load(&missing),
            Err(ArtifactError::Io { .. })
        ));
        assert!(PolicyArtifact::load_or_empty(&missing).tables.is_empty());

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, b"{not json").unwrap();
        assert!(matches!(
            PolicyArtifact::load(&corrupt),
            Err(ArtifactError::Parse { .. })
        ));
        assert!(PolicyArtifact::load_or_empty(&corrupt).tables.is_empty());
        assert!(PolicyArtifact::load_or_empty(&corrupt).table_for("J7").is_empty());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v9.json");
        fs::write(&path, br#"{"format_version": 9, "tables": {}}"#).unwrap();
        assert!(matches!(
            PolicyArtifact::load(&path),
            Err(ArtifactError::Version { found: 9, .. })
        ));
    }
}
