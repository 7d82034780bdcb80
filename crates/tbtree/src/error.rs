use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("illegal arguments: {0}")]
    IllegalArguments(&'static str),

    #[error("tree is already closed")]
    AlreadyClosed,

    #[error("tree is read-only")]
    ReadOnly,

    #[error("key not found")]
    KeyNotFound,

    #[error("corrupted index: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Appendable(#[from] ledgerkv_appendable::Error),
}
