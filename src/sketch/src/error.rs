use crate::hll::{MAX_PRECISION, MIN_PRECISION};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SketchError {
    #[error("precision must be between {MIN_PRECISION} and {MAX_PRECISION}, got {0}")]
    InvalidPrecision(u8),

    /// Merging sketches of different precision is refused outright. There is
    /// no downsampling path; the caller must build both sides with the same
    /// precision.
    #[error("precision mismatch: local p={local}, remote p={remote}")]
    PrecisionMismatch { local: u8, remote: u8 },

    #[error("malformed sketch payload: {0}")]
    MalformedPayload(String),
}
