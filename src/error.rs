//! Unified error handling for the acquisition and delivery pipeline.
//!
//! Four failure families drive scheduler policy: transport faults abort the
//! cycle (and terminate the process when the device is absent entirely),
//! decode faults abort the cycle, persistence faults are fatal for the cycle
//! because the durability guarantee cannot be upheld, and delivery faults are
//! recoverable because the backlog is retained intact.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeterError>;

/// Device/bus level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("illegal register request at address {address}: exception code {code:#04x}")]
    IllegalRequest { address: u16, code: u8 },

    #[error("device unreachable on {device}: {reason}")]
    DeviceUnreachable { device: String, reason: String },

    #[error("no response from device within {0:?}")]
    Timeout(Duration),

    #[error("malformed response frame: {0}")]
    BadFrame(String),
}

/// Register-data decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeFault {
    #[error("non-finite bit pattern {0:#010x}")]
    NonFinite(u32),

    #[error("zero or negative mean phase current")]
    ZeroMeanCurrent,

    #[error("short register response: expected {expected} words, got {got}")]
    ShortResponse { expected: usize, got: usize },

    #[error("unparseable stored field: {0}")]
    BadField(String),
}

/// Main error type for the meter service.
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("decode error for {field}: {fault}")]
    Decode {
        field: String,
        #[source]
        fault: DecodeFault,
    },

    #[error("backlog persistence failed ({op} {path}): {reason}")]
    Persist {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("delivery to {url} failed: {reason}")]
    Delivery { url: String, reason: String },
}

impl MeterError {
    pub fn config(msg: impl Into<String>) -> Self {
        MeterError::Config(msg.into())
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        MeterError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn decode(field: impl Into<String>, fault: DecodeFault) -> Self {
        MeterError::Decode {
            field: field.into(),
            fault,
        }
    }

    pub fn persist(op: &'static str, path: impl Into<String>, reason: impl Into<String>) -> Self {
        MeterError::Persist {
            op,
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn delivery(url: impl Into<String>, reason: impl Into<String>) -> Self {
        MeterError::Delivery {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Faults that should terminate the process (after a grace delay) so a
    /// supervisor can restart it, rather than spinning against a dead bus.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeterError::Transport(TransportError::DeviceUnreachable { .. })
        )
    }
}
