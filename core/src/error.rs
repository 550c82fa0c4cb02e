//! Error kinds shared across the wire protocol, codecs and state machines.
//!
//! See spec §7: each kind below maps to one of the error categories the
//! protocol distinguishes. None of these are recovery points on their own;
//! the client facade decides per-request whether to propagate or swallow
//! one (see `crate::client`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation timed out before completion")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(
        "value {value} out of allowed range [{min}; {max}] for property {property_name}"
    )]
    ValueOutOfRange {
        property_name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("device reported error {error_code:?} in response to opcode {request_opcode:?}")]
    DeviceError {
        request_opcode: crate::model::Opcode,
        error_code: crate::model::ErrorCode,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
