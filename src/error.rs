//! Kernel status codes and the crate-wide error type
//!
//! Every fallible operation in the VM and block-cache core returns
//! [`Result`]. The numeric codes match the syscall ABI so a dispatcher can
//! hand them straight back to user space.

use thiserror::Error;

// ============================================================================
// Status Codes
// ============================================================================

/// Raw status value returned across the syscall boundary
pub type Status = i32;

pub const NO_ERROR: Status = 0;
pub const ERR_NOT_SUPPORTED: Status = -2;
pub const ERR_NOT_FOUND: Status = -3;
pub const ERR_NO_MEMORY: Status = -4;
pub const ERR_NO_RESOURCES: Status = -5;
pub const ERR_INVALID_ARGS: Status = -10;
pub const ERR_OUT_OF_RANGE: Status = -13;
pub const ERR_BUFFER_TOO_SMALL: Status = -14;
pub const ERR_BAD_STATE: Status = -20;
pub const ERR_ACCESS_DENIED: Status = -30;
pub const ERR_IO: Status = -40;
pub const ERR_NO_SPACE: Status = -56;

// ============================================================================
// Error Type
// ============================================================================

/// Recoverable failures of the VM and block-cache core
///
/// Invariant violations are not represented here; they panic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("operation not supported")]
    NotSupported,

    #[error("not found")]
    NotFound,

    #[error("out of memory")]
    NoMemory,

    #[error("no resources available")]
    NoResources,

    #[error("invalid arguments")]
    InvalidArgs,

    #[error("offset or length out of range")]
    OutOfRange,

    #[error("buffer too small")]
    BufferTooSmall,

    #[error("object in bad state")]
    BadState,

    #[error("access denied")]
    AccessDenied,

    #[error("device I/O error")]
    Io,

    #[error("no space left on device")]
    NoSpace,
}

impl Error {
    /// Status code for this error
    pub const fn status(self) -> Status {
        match self {
            Error::NotSupported => ERR_NOT_SUPPORTED,
            Error::NotFound => ERR_NOT_FOUND,
            Error::NoMemory => ERR_NO_MEMORY,
            Error::NoResources => ERR_NO_RESOURCES,
            Error::InvalidArgs => ERR_INVALID_ARGS,
            Error::OutOfRange => ERR_OUT_OF_RANGE,
            Error::BufferTooSmall => ERR_BUFFER_TOO_SMALL,
            Error::BadState => ERR_BAD_STATE,
            Error::AccessDenied => ERR_ACCESS_DENIED,
            Error::Io => ERR_IO,
            Error::NoSpace => ERR_NO_SPACE,
        }
    }

    /// Decode a negative status code
    pub const fn from_status(status: Status) -> Option<Self> {
        Some(match status {
            ERR_NOT_SUPPORTED => Error::NotSupported,
            ERR_NOT_FOUND => Error::NotFound,
            ERR_NO_MEMORY => Error::NoMemory,
            ERR_NO_RESOURCES => Error::NoResources,
            ERR_INVALID_ARGS => Error::InvalidArgs,
            ERR_OUT_OF_RANGE => Error::OutOfRange,
            ERR_BUFFER_TOO_SMALL => Error::BufferTooSmall,
            ERR_BAD_STATE => Error::BadState,
            ERR_ACCESS_DENIED => Error::AccessDenied,
            ERR_IO => Error::Io,
            ERR_NO_SPACE => Error::NoSpace,
            _ => return None,
        })
    }
}

/// Crate-wide result alias
pub type Result<T> = core::result::Result<T, Error>;

/// Collapse a result into the status a syscall would return
pub fn status_of<T>(result: &Result<T>) -> Status {
    match result {
        Ok(_) => NO_ERROR,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_negative() {
        let all = [
            Error::NotSupported,
            Error::NotFound,
            Error::NoMemory,
            Error::NoResources,
            Error::InvalidArgs,
            Error::OutOfRange,
            Error::BufferTooSmall,
            Error::BadState,
            Error::AccessDenied,
            Error::Io,
            Error::NoSpace,
        ];
        for err in all {
            assert!(err.status() < 0);
            assert_eq!(Error::from_status(err.status()), Some(err));
        }
    }

    #[test]
    fn test_status_of() {
        let ok: Result<u32> = Ok(7);
        let err: Result<u32> = Err(Error::NoResources);
        assert_eq!(status_of(&ok), NO_ERROR);
        assert_eq!(status_of(&err), ERR_NO_RESOURCES);
        assert_eq!(Error::from_status(-9999), None);
    }
}
