//! Error types for engine operations

use std::fmt;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Per-item outcome reported by the engine after it finishes consuming an
/// item's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// The item was processed successfully
    Ok,
    /// The compression method is not supported by the engine build
    UnsupportedMethod,
    /// The item's data is corrupted
    DataError,
    /// Checksum verification failed
    CrcError,
    /// An outcome code this crate does not know
    Unknown(i32),
}

impl OperationResult {
    /// Decode the raw outcome code the engine passes across the boundary
    pub fn from_code(code: i32) -> Self {
        match code {
            sevenzip2_sys::OP_RESULT_OK => OperationResult::Ok,
            sevenzip2_sys::OP_RESULT_UNSUPPORTED_METHOD => OperationResult::UnsupportedMethod,
            sevenzip2_sys::OP_RESULT_DATA_ERROR => OperationResult::DataError,
            sevenzip2_sys::OP_RESULT_CRC_ERROR => OperationResult::CrcError,
            other => OperationResult::Unknown(other),
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationResult::Ok => write!(f, "ok"),
            OperationResult::UnsupportedMethod => write!(f, "unsupported compression method"),
            OperationResult::DataError => write!(f, "data error"),
            OperationResult::CrcError => write!(f, "CRC check failed"),
            OperationResult::Unknown(code) => write!(f, "unknown outcome (code {})", code),
        }
    }
}

/// Error type for engine operations
#[derive(Debug)]
pub enum Error {
    /// The engine module is missing, failed to load, or lacks the required
    /// entry points
    LibraryLoad(String),
    /// The engine rejected the requested archive format class
    UnsupportedFormat {
        /// Name of the rejected format
        format: String,
    },
    /// The lifecycle manager was asked to do something its current state
    /// forbids (e.g. re-pointing the module path while loaded)
    InvalidState(String),
    /// Metadata or data for one item could not be produced; the operation is
    /// marked failed but already-written items stand
    ItemResolution {
        /// Name or path of the offending item
        item: String,
        /// Underlying cause
        source: std::io::Error,
    },
    /// The engine reported a non-success per-item outcome
    Operation {
        /// The outcome the engine reported
        result: OperationResult,
    },
    /// A subscriber requested cancellation; no further items were processed
    Cancelled,
    /// The engine returned a failing result code from a native call
    Native {
        /// Raw HRESULT from the engine
        code: i32,
    },
    /// I/O error
    Io(std::io::Error),
    /// Invalid argument
    InvalidArgument(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::LibraryLoad(msg) => write!(f, "engine module load error: {}", msg),
            Error::UnsupportedFormat { format } => {
                write!(f, "the engine module does not support the {} format", format)
            }
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::ItemResolution { item, source } => {
                write!(f, "failed to resolve item '{}': {}", item, source)
            }
            Error::Operation { result } => write!(f, "engine reported item failure: {}", result),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Native { code } => write!(f, "engine call failed (HRESULT {:#010x})", *code as u32),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ItemResolution { source, .. } => Some(source),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// Check an HRESULT from the engine and convert to Result
    pub(crate) fn from_hresult(code: i32) -> Result<()> {
        if code == sevenzip2_sys::S_OK {
            Ok(())
        } else if code == sevenzip2_sys::E_ABORT {
            Err(Error::Cancelled)
        } else {
            Err(Error::Native { code })
        }
    }
}
