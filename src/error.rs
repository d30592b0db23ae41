//! Error taxonomy shared by every layer of the crate.
//!
//! Errors fall into four groups, and callers usually only care which group an
//! error belongs to:
//!
//! | Group | Variants | Handling |
//! |---|---|---|
//! | transient I/O | `Disconnected`, `ChannelClosed`, `Timeout`, `DeviceNotFound`, transient `Transport` | retried by [`crate::supervisor::Supervisor`] within the call's retry budget |
//! | integrity | `Integrity` | never retried, aborts the pass |
//! | configuration | `InvalidDeviceId`, `DegenerateWindow`, `WindowTooLarge`, `InvalidRequest`, `Unsupported` | returned immediately |
//! | outcome | `ConnectFailed`, `Unconfirmed` | produced by the supervisor once retrying is over |

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{Characteristic, DeviceFamily};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("device {device} disconnected: {reason}")]
    Disconnected { device: String, reason: String },

    #[error("notification channel closed")]
    ChannelClosed,

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("device {0} was not found")]
    DeviceNotFound(String),

    #[error("bluetooth transport error: {source}")]
    Transport {
        transient: bool,
        #[source]
        source: btleplug::Error,
    },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("invalid device id {0:?}")]
    InvalidDeviceId(String),

    #[error("degenerate download window: interval={interval_ms} ms, oldest={oldest_ms}, newest={newest_ms}")]
    DegenerateWindow {
        interval_ms: u32,
        oldest_ms: u64,
        newest_ms: u64,
    },

    #[error("download window of {slots} values exceeds the logger capacity of {capacity}")]
    WindowTooLarge { slots: u64, capacity: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{characteristic:?} is not available on {family}")]
    Unsupported {
        characteristic: Characteristic,
        family: DeviceFamily,
    },

    #[error("malformed {what} payload: expected {expected} bytes, got {got}")]
    Payload {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("could not connect to {device} after {attempts} attempt(s): {source}")]
    ConnectFailed {
        device: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("{operation} on {device} may or may not have taken effect: {source}")]
    Unconfirmed {
        device: String,
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    OutOfRange(String),
}

impl Error {
    /// Whether the error is a recoverable I/O fault that a reconnect may cure.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Disconnected { .. }
            | Error::ChannelClosed
            | Error::Timeout { .. }
            | Error::DeviceNotFound(_) => true,
            Error::Transport { transient, .. } => *transient,
            _ => false,
        }
    }
}

impl From<btleplug::Error> for Error {
    fn from(source: btleplug::Error) -> Self {
        // BlueZ reports dropped links as D-Bus errors, which btleplug wraps in
        // `Other`/`RuntimeError`, so those count as transient as well.
        let transient = matches!(
            source,
            btleplug::Error::NotConnected
                | btleplug::Error::TimedOut(_)
                | btleplug::Error::RuntimeError(_)
                | btleplug::Error::Other(_)
        );
        Error::Transport { transient, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::ChannelClosed.is_transient());
        assert!(
            Error::Disconnected {
                device: "AA:BB:CC:DD:EE:FF".into(),
                reason: "link lost".into()
            }
            .is_transient()
        );
        assert!(Error::from(btleplug::Error::NotConnected).is_transient());
        assert!(!Error::from(btleplug::Error::DeviceNotFound).is_transient());
        assert!(!Error::Integrity("slot mismatch".into()).is_transient());
        assert!(!Error::InvalidDeviceId("nope".into()).is_transient());
    }

    #[test]
    fn wrapped_errors_are_final() {
        let err = Error::ConnectFailed {
            device: "AA:BB:CC:DD:EE:FF".into(),
            attempts: 3,
            source: Box::new(Error::ChannelClosed),
        };
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "could not connect to AA:BB:CC:DD:EE:FF after 3 attempt(s): notification channel closed"
        );
    }
}
