//! Error kinds recognized by the engine.

use thiserror::Error;

/// Error surfaced synchronously or asynchronously across the EIL boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed configuration dictionary, non-16-byte broadcast code,
    /// unknown QoS key, or non-dict properties value. Surfaced synchronously
    /// on `SetConfiguration`.
    #[error("invalid-args: {0}")]
    InvalidArgs(&'static str),

    /// Downstream transport rejected configure/qos. Surfaced asynchronously;
    /// the stream is released.
    #[error("Unable to configure")]
    UnableToConfigure,

    /// The Setup was torn down while a request was pending.
    #[error("Canceled")]
    Canceled,

    /// I/O channel HUP/ERR/NVAL before STREAMING. Never surfaced to EIL
    /// except via a property change; handled like a disconnect.
    #[error("transport-io error")]
    TransportIo,

    /// Host lacks the ISO transport feature. Surfaced once at init.
    #[error("not-supported")]
    NotSupported,
}

/// Internal BASE-parsing failure. Never crosses the
/// EIL boundary: the offending subgroup is skipped and parsing continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("BASE blob truncated while reading {0}")]
    Truncated(&'static str),
    #[error("declared length for {field} ({len}) overruns the remaining buffer")]
    LengthOverrun { field: &'static str, len: usize },
}

pub type Result<T> = core::result::Result<T, EngineError>;
