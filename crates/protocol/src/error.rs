//! USB error taxonomy
//!
//! Every native status code is translated into [`UsbError`] at the backend
//! boundary. Descriptor framing problems are reported as [`DescriptorError`]
//! and stay local to the sub-tree that failed to decode.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while walking descriptor byte streams
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DescriptorError {
    /// A descriptor declares more bytes than remain in the buffer
    #[error("descriptor at offset {offset} declares {declared} bytes but only {remaining} remain")]
    Truncated {
        offset: usize,
        declared: usize,
        remaining: usize,
    },

    /// A descriptor's bLength is too small for its fixed layout
    #[error("descriptor at offset {offset} has invalid bLength {length}")]
    InvalidLength { offset: usize, length: u8 },

    /// A descriptor of another type was found where a specific one was required
    #[error("expected descriptor type {expected:#04x} at offset {offset}, found {found:#04x}")]
    UnexpectedType {
        offset: usize,
        expected: u8,
        found: u8,
    },

    /// The configuration ended before every announced interface was seen
    #[error("configuration announces {expected} interfaces but only {found} were present")]
    MissingInterface { expected: u8, found: u8 },
}

/// How a caller should react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying as-is (timeouts, stalls, cancellation, overflow)
    Transient,
    /// Needs external intervention (device gone, permissions)
    Terminal,
    /// The caller misused the API
    Programming,
    /// Anything else
    Other,
}

/// USB error taxonomy shared by every layer above the native backend
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum UsbError {
    #[error("input/output error")]
    Io,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("access denied (insufficient permissions)")]
    AccessDenied,

    #[error("no such device (it may have been disconnected)")]
    NoDevice,

    #[error("entity not found")]
    NotFound,

    #[error("resource busy")]
    ResourceBusy,

    #[error("operation timed out")]
    Timeout,

    #[error("overflow: device sent more data than requested")]
    Overflow,

    #[error("pipe error")]
    Pipe,

    #[error("operation interrupted")]
    Interrupted,

    #[error("insufficient memory")]
    InsufficientMemory,

    #[error("operation not supported on this platform")]
    NotSupported,

    #[error("other error: {0}")]
    Other(String),

    /// The wrapper (or one of its ancestors) has already been torn down
    #[error("{0} has already been disposed")]
    AlreadyDisposed(String),

    #[error("malformed descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
}

impl UsbError {
    /// Shorthand for [`UsbError::AlreadyDisposed`]
    pub fn disposed(what: &str) -> Self {
        UsbError::AlreadyDisposed(what.to_string())
    }

    /// Classify the error for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            UsbError::Timeout
            | UsbError::ResourceBusy
            | UsbError::Overflow
            | UsbError::Interrupted => ErrorClass::Transient,
            UsbError::NoDevice | UsbError::AccessDenied | UsbError::NotFound | UsbError::Pipe => {
                ErrorClass::Terminal
            }
            UsbError::AlreadyDisposed(_) | UsbError::InvalidParameter | UsbError::NotSupported => {
                ErrorClass::Programming
            }
            UsbError::Io
            | UsbError::InsufficientMemory
            | UsbError::Other(_)
            | UsbError::Descriptor(_) => ErrorClass::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Type alias for USB results
pub type Result<T> = std::result::Result<T, UsbError>;
