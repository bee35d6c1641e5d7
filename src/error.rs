//! The error taxonomy shared by every layer of the engine.
//!
//! Backend specific failures (USB, pin access, register access) are folded into one of the four
//! kinds at the cable boundary, so callers only ever have to match on [`ErrorKind`].
use std::time::Duration;

/// The four classes of failure a command can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Unsupported,
    Timeout,
    BusFault,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JtagError {
    /// Malformed request: zero length, out-of-range TAP index, illegal end state.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The capability is absent, or the request exceeds what the cable can do.
    #[error("Operation not supported: {0}")]
    Unsupported(String),
    /// A bounded wait (lock or transfer) was exceeded.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    /// Low-level transport failure reported by the cable.
    #[error("Bus fault: {0}")]
    BusFault(String),
}

impl JtagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JtagError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            JtagError::Unsupported(_) => ErrorKind::Unsupported,
            JtagError::Timeout(_) => ErrorKind::Timeout,
            JtagError::BusFault(_) => ErrorKind::BusFault,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        JtagError::InvalidArgument(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        JtagError::Unsupported(msg.into())
    }

    /// Wrap a backend error that only implements `Debug` (embedded-hal pins, register blocks).
    pub(crate) fn bus_fault(err: impl core::fmt::Debug) -> Self {
        JtagError::BusFault(format!("{err:?}"))
    }
}

pub type Result<T, E = JtagError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(JtagError::invalid("x").kind(), ErrorKind::InvalidArgument);
        assert_eq!(JtagError::unsupported("x").kind(), ErrorKind::Unsupported);
        assert_eq!(
            JtagError::Timeout(Duration::from_millis(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(JtagError::bus_fault("pin").kind(), ErrorKind::BusFault);
    }

    #[test]
    fn bus_fault_keeps_debug_text() {
        #[derive(Debug)]
        struct PinError;
        assert_eq!(
            JtagError::bus_fault(PinError).to_string(),
            "Bus fault: PinError"
        );
    }
}
