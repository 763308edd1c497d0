//! Authorized-users file loading.
//!
//! The file holds one username per line. Loading is strict: a single
//! malformed line rejects the whole file and nothing is kept.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::user::{Username, UsernameError};

/// Errors that can occur while loading the authorized-users file.
#[derive(Error, Debug)]
pub enum UsersFileError {
    #[error("Failed to read authorized users file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid username {value:?} on line {line}: {reason}")]
    InvalidUsername {
        line: usize,
        value: String,
        reason: UsernameError,
    },

    #[error("Authorized users file contains no usernames")]
    Empty,
}

/// The validated list of users allowed to connect, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedUsers {
    names: Vec<Username>,
}

impl AuthorizedUsers {
    /// Reads and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UsersFileError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| UsersFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let users = Self::parse(&contents)?;
        debug!(path = %path.display(), count = users.len(), "Loaded authorized users");
        Ok(users)
    }

    /// Validates file contents already in memory.
    ///
    /// Blank lines are skipped, duplicates are kept once.
    pub fn parse(contents: &str) -> Result<Self, UsersFileError> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();

        for (idx, raw) in contents.lines().enumerate() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }

            let name = Username::parse(line).map_err(|reason| UsersFileError::InvalidUsername {
                line: idx + 1,
                value: line.to_string(),
                reason,
            })?;

            if seen.insert(name.clone()) {
                names.push(name);
            } else {
                warn!(username = %name, line = idx + 1, "Duplicate authorized user ignored");
            }
        }

        if names.is_empty() {
            return Err(UsersFileError::Empty);
        }

        Ok(Self { names })
    }

    /// Number of distinct authorized users.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false for a loaded list; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterates usernames in file order.
    pub fn iter(&self) -> impl Iterator<Item = &Username> {
        self.names.iter()
    }
}

impl IntoIterator for AuthorizedUsers {
    type Item = Username;
    type IntoIter = std::vec::IntoIter<Username>;

    fn into_iter(self) -> Self::IntoIter {
        self.names.into_iter()
    }
}
