use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("illegal arguments: {0}")]
    IllegalArguments(&'static str),

    #[error("appendable is read-only")]
    ReadOnly,

    #[error("appendable is already closed")]
    AlreadyClosed,

    #[error("path is not a directory: {}", .0.display())]
    PathIsNotADirectory(PathBuf),

    #[error("corrupted appendable: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// `true` if the error indicates reading past the logical end.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
