// On-disk layout for one coordination root.

use std::fs;
use std::path::{Path, PathBuf};

use hive_types::PROTOCOL_VERSION;

use crate::error::CoordResult;

/// Layout of a coordination state directory: the database file (plus WAL
/// sidecars the engine manages), an artifacts directory for out-of-band
/// payloads, and a protocol version marker.
#[derive(Debug, Clone)]
pub struct CoordPaths {
    root: PathBuf,
}

impl CoordPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_file(&self) -> PathBuf {
        self.root.join("coordination.db")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn artifact_file(&self, name: &str) -> PathBuf {
        self.artifacts_dir().join(name)
    }

    pub fn version_file(&self) -> PathBuf {
        self.root.join("VERSION")
    }

    /// Create the directory tree and stamp the protocol version if absent.
    pub fn ensure(&self) -> CoordResult<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.artifacts_dir())?;
        let version_file = self.version_file();
        if !version_file.exists() {
            fs::write(&version_file, PROTOCOL_VERSION)?;
        }
        Ok(())
    }

    /// The protocol version recorded on disk, if the marker exists.
    pub fn recorded_version(&self) -> CoordResult<Option<String>> {
        let version_file = self.version_file();
        if !version_file.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(version_file)?;
        Ok(Some(raw.trim().to_string()))
    }
}
