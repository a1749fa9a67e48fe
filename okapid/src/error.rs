use thiserror::Error;

use bgp_wire::{NotifyCode, WireError};

/// Error kinds shared by both cores. The variant decides the recovery
/// policy: Transient and Kernel recover locally, Configuration goes back
/// to the caller, Protocol resets the peer, Fatal terminates the process.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Retriable I/O; back off and re-arm.
    #[error("transient i/o: {0}")]
    Transient(#[from] std::io::Error),

    /// Peer sent malformed or semantically illegal data. Mapped to a
    /// NOTIFICATION before tear-down.
    #[error("protocol error: code {code} subcode {subcode}")]
    Protocol {
        code: NotifyCode,
        subcode: u8,
        data: Vec<u8>,
    },

    /// Filter rejected a route; no propagation, no tear-down.
    #[error("rejected by policy")]
    Policy,

    /// Caller asked for something inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Kernel refused a mutation; in-memory intent is retained for adds.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Impossible state; the process exits after best-effort Cease.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        CoreError::Configuration(msg.into())
    }

    pub fn kernel<S: Into<String>>(msg: S) -> Self {
        CoreError::Kernel(msg.into())
    }

    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        CoreError::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Fatal(_))
    }
}

impl From<WireError> for CoreError {
    fn from(err: WireError) -> Self {
        CoreError::Protocol {
            code: err.code(),
            subcode: err.subcode(),
            data: err.data().to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
