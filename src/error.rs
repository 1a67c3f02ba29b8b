use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SubwordError>;

#[derive(Error, Debug)]
pub enum SubwordError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid split pattern: {0}")]
    Pattern(#[from] fancy_regex::Error),

    /// Every count handed to a probability table was zero.
    #[error("cannot build a probability table from a zero total count")]
    EmptyTable,

    /// No path through the table reaches the end of the word.
    /// `position` is the furthest reachable character offset.
    #[error("word {word:?} has no segmentation: nothing in the table continues from character {position}")]
    Uncoverable { word: String, position: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("model serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SubwordError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
