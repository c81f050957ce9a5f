//! On-disk conversation storage.
//!
//! Layout under the data directory:
//!
//! ```text
//! <root>/
//! ├── streams/<name>.json                  (resumable, overwritten on save)
//! └── logs/<YYYY-MM-DD-HH-MM-SS>.json      (write-once)
//! ```

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;

use gee_types::Message;

use crate::atomic_write::{atomic_write, atomic_write_new};
use crate::record::{decode_history, encode_history};

const STREAMS_DIR: &str = "streams";
const LOGS_DIR: &str = "logs";
const EXTENSION: &str = "json";
const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
/// Upper bound on `-N` suffixes tried when several logs land in one second.
const MAX_LOG_SUFFIX: u32 = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid stream name {0:?}: names must be non-empty and contain no path separators")]
    InvalidStreamName(String),
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed history in {}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn serialization(path: &Path, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn validate_stream_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0');
    if invalid {
        return Err(StoreError::InvalidStreamName(name.to_string()));
    }
    Ok(())
}

/// Named streams and timestamped logs rooted at a data directory.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn streams_dir(&self) -> PathBuf {
        self.root.join(STREAMS_DIR)
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn stream_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_stream_name(name)?;
        Ok(self.streams_dir().join(format!("{name}.{EXTENSION}")))
    }

    /// Names of all saved streams, sorted. A missing streams directory means
    /// there are none.
    pub fn list_streams(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.streams_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn stream_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.stream_path(name)?.is_file())
    }

    /// Load a stream's history. A stream that was never saved is empty.
    pub fn load_stream(&self, name: &str) -> Result<Vec<Message>, StoreError> {
        let path = self.stream_path(name)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let messages =
            decode_history(&text).map_err(|e| StoreError::serialization(&path, e))?;
        tracing::debug!(stream = name, messages = messages.len(), "Loaded stream");
        Ok(messages)
    }

    /// Replace the stream's saved history with `messages`.
    pub fn save_stream(&self, name: &str, messages: &[Message]) -> Result<PathBuf, StoreError> {
        let path = self.stream_path(name)?;
        let text = encode_history(messages).map_err(|e| StoreError::serialization(&path, e))?;

        let dir = self.streams_dir();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        atomic_write(&path, text.as_bytes()).map_err(|e| StoreError::io(&path, e))?;

        tracing::info!(stream = name, messages = messages.len(), "Saved stream");
        Ok(path)
    }

    /// Write a new log of `messages` stamped with the current local time.
    pub fn write_log(&self, messages: &[Message]) -> Result<PathBuf, StoreError> {
        self.write_log_at(messages, Local::now())
    }

    /// Write a new log stamped with `at`. Never overwrites an existing log: if
    /// one already exists for that second, a `-N` suffix is added.
    pub fn write_log_at(
        &self,
        messages: &[Message],
        at: DateTime<Local>,
    ) -> Result<PathBuf, StoreError> {
        let dir = self.logs_dir();
        let stamp = at.format(LOG_TIMESTAMP_FORMAT).to_string();
        let text = encode_history(messages).map_err(|e| StoreError::serialization(&dir, e))?;

        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        for suffix in 0..MAX_LOG_SUFFIX {
            let file_name = if suffix == 0 {
                format!("{stamp}.{EXTENSION}")
            } else {
                format!("{stamp}-{suffix}.{EXTENSION}")
            };
            let path = dir.join(file_name);
            match atomic_write_new(&path, text.as_bytes()) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), messages = messages.len(), "Wrote log");
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }

        Err(StoreError::io(
            &dir.join(format!("{stamp}.{EXTENSION}")),
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                "too many logs written in the same second",
            ),
        ))
    }
}
