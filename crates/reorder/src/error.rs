//! Error types for the reorder engine.

use std::fmt;

use h264_reader::rbsp::BitReaderError;

/// Errors raised while tracking decode and display order.
///
/// Variants group by where the failure happened:
///
/// - **Framing**: [`Framing`](Self::Framing), [`CodecData`](Self::CodecData)
///   for byte-level problems splitting an access unit or reading `avcC`/`hvcC`.
/// - **Syntax**: [`Bitstream`](Self::Bitstream), [`Unsupported`](Self::Unsupported)
///   for parameter sets and slice headers.
/// - **State**: [`MissingParameterSet`](Self::MissingParameterSet),
///   [`NoActiveSps`](Self::NoActiveSps), [`Picture`](Self::Picture),
///   [`NoSlice`](Self::NoSlice).
#[derive(Debug, thiserror::Error)]
pub enum ReorderError {
    /// A NAL unit could not be split out of the access unit.
    #[error("invalid NAL framing: {0}")]
    Framing(String),

    /// The decoder configuration record in the caps was malformed.
    #[error("malformed codec data: {0}")]
    CodecData(String),

    /// A syntax element could not be read from the RBSP.
    #[error("bitstream error: {0}")]
    Bitstream(String),

    /// The stream uses syntax this engine does not track.
    #[error("unsupported syntax: {0}")]
    Unsupported(&'static str),

    /// A slice or PPS referenced a parameter set that was never received.
    #[error("{kind} {id} referenced but not received")]
    MissingParameterSet { kind: ParameterSetKind, id: u32 },

    /// A picture needs an SPS but none has been activated yet.
    #[error("no active SPS")]
    NoActiveSps,

    /// The picture could not be placed in decode order.
    #[error("picture rejected: {0}")]
    Picture(&'static str),

    /// The access unit carried no slice data.
    #[error("access unit carries no slice data")]
    NoSlice,
}

/// Which kind of parameter set was missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterSetKind {
    Vps,
    Sps,
    Pps,
}

impl fmt::Display for ParameterSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vps => write!(f, "VPS"),
            Self::Sps => write!(f, "SPS"),
            Self::Pps => write!(f, "PPS"),
        }
    }
}

impl From<BitReaderError> for ReorderError {
    fn from(e: BitReaderError) -> Self {
        ReorderError::Bitstream(format!("{e:?}"))
    }
}

/// Convenience alias for `Result<T, ReorderError>`.
pub type Result<T> = std::result::Result<T, ReorderError>;
