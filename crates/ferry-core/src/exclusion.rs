//! Persistent list of file names that must never be processed again.
//!
//! One name per line. Files whose workers got stuck are appended so a later
//! run skips them outright.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ExclusionError {
    #[error("exclusion list {path} is not a regular file")]
    NotAFile { path: PathBuf },

    #[error("exclusion list I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct ExclusionList {
    path: PathBuf,
    names: Mutex<HashSet<String>>,
}

impl ExclusionList {
    /// Load the list at `path`. A missing file is an empty list and is created
    /// on the first append.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ExclusionError> {
        let path = path.as_ref().to_path_buf();
        let names = if path.exists() {
            if !path.is_file() {
                return Err(ExclusionError::NotAFile { path });
            }
            std::fs::read_to_string(&path)
                .map_err(|source| ExclusionError::Io {
                    path: path.clone(),
                    source,
                })?
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()
        } else {
            HashSet::new()
        };
        tracing::debug!(path = %path.display(), entries = names.len(), "loaded exclusion list");
        Ok(Self {
            path,
            names: Mutex::new(names),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.names.lock().contains(file_name)
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }

    /// Add `file_name` and persist it. Returns false if it was already listed.
    pub fn append(&self, file_name: &str) -> Result<bool, ExclusionError> {
        let mut names = self.names.lock();
        if names.contains(file_name) {
            return Ok(false);
        }
        let io_err = |source| ExclusionError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{file_name}").map_err(io_err)?;
        names.insert(file_name.to_string());
        tracing::info!(file = file_name, list = %self.path.display(), "added to exclusion list");
        Ok(true)
    }
}
