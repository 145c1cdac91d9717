use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Header or B-tree structure inconsistent with the on-disk format.
    #[error("corrupt image: {0}")]
    CorruptImage(String),

    /// Valid bcachefs image, but a metadata revision this reader does not handle.
    #[error("unsupported metadata version: {0}")]
    UnsupportedVersion(u16),

    /// Backing storage is shorter than the metadata declares.
    #[error("truncated image: need {expected} bytes, have {actual}")]
    TruncatedImage { expected: u64, actual: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("{0} not supported")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<binrw::Error> for Error {
    fn from(err: binrw::Error) -> Self {
        Error::CorruptImage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
