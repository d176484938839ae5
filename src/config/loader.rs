//! Configuration loading from disk.
//!
//! A configured path may be a file or a directory. Directory entries are read
//! in lexical order and only `.toml` and `.json` files are considered; nested
//! directories are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::AgentConfig;
use crate::config::sources::RawConfigSource;
use crate::config::validation::Diagnostics;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid flag: {0}")]
    Flag(String),

    #[error(transparent)]
    Rejected(#[from] Diagnostics),
}

impl ConfigError {
    /// A rejected configuration can be survived on reload; failing to read
    /// or parse the input cannot.
    pub fn is_fatal_on_reload(&self) -> bool {
        !matches!(self, ConfigError::Rejected(_))
    }
}

/// File sources read from disk, plus the warnings produced along the way.
#[derive(Debug, Default)]
pub struct LoadedFiles {
    pub sources: Vec<RawConfigSource>,
    pub warnings: Vec<String>,
}

/// Load every configured path, preserving order.
pub fn load_paths(paths: &[PathBuf]) -> Result<LoadedFiles, ConfigError> {
    let mut loaded = LoadedFiles::default();

    for path in paths {
        let meta = fs::metadata(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let files = if meta.is_dir() {
            dir_entries(path)?
        } else {
            vec![path.clone()]
        };

        for file in files {
            match load_file(&file)? {
                Some(config) => loaded.sources.push(RawConfigSource::File { path: file, config }),
                None => loaded
                    .warnings
                    .push(format!("No configuration loaded from {}", file.display())),
            }
        }
    }

    Ok(loaded)
}

/// Parse one file. Returns `None` for an empty file.
pub fn load_file(path: &Path) -> Result<Option<AgentConfig>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(None);
    }

    let parsed = if is_json(path) {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    } else {
        toml::from_str(&content).map_err(|e| e.to_string())
    };

    parsed.map(Some).map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

fn dir_entries(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && (is_json(&path) || has_extension(&path, "toml")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn is_json(path: &Path) -> bool {
    has_extension(path, "json")
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}
