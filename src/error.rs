use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CensusError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Offset is a byte position into the (continuation-stripped) input.
    #[error("could not parse GAP text at byte {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("could not launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bad config: {0}")]
    Config(String),

    #[error("missing input: {0}")]
    Missing(String),

    #[error("worker thread pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, CensusError>;

impl CensusError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        CensusError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn parse(offset: usize, message: impl Into<String>) -> Self {
        CensusError::Parse {
            offset,
            message: message.into(),
        }
    }
}

/// Reads a whole file, replacing invalid UTF-8 (GAP logs can contain stray
/// bytes from the terminal).
pub fn read_text(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| CensusError::io(path, e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn write_text(path: impl AsRef<Path>, contents: &str) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, contents).map_err(|e| CensusError::io(path, e))
}

pub fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    std::fs::create_dir_all(path).map_err(|e| CensusError::io(path, e))
}
