use thiserror::Error;

/// Error kinds produced by the core. A patcher function returns one of
/// these rather than panicking; callers may catch and continue with the
/// next transformation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("anchor not found: {0}")]
    NotFound(&'static str),

    #[error("address 0x{va:x} is out of bounds")]
    OutOfBounds { va: u64 },

    #[error("unrecognised iBoot version: {0}")]
    UnrecognisedVersion(i64),

    #[error("immediate not representable: {0}")]
    Unrepresentable(String),

    #[error("invalid cursor state: {0}")]
    InvalidCursorState(String),
}

pub type Result<T> = std::result::Result<T, Error>;
