use thiserror::Error;

/// Errors raised while building or interpreting NaviLink payloads.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        expected: String,
    },

    #[error("invalid operation mode table entry: {0}")]
    InvalidModeTable(String),
}
