use thiserror::Error;

use crate::exception::ExceptionCode;
use crate::table::PrimaryTable;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("malformed MBAP header: {0}")]
    MalformedHeader(String),
    #[error("invalid MBAP length: field says {declared}, {available} bytes available")]
    InvalidLength { declared: usize, available: usize },

    #[error("modbus exception: {0}")]
    Exception(ExceptionCode),

    #[error("unknown entry: {0}")]
    UnknownEntry(String),
    #[error("improper response: {0}")]
    ImproperResponse(String),
    #[error("no connection to server")]
    NoConnection,

    #[error("invalid value '{value}': {reason}")]
    InvalidValue { value: String, reason: String },
    #[error("invalid mask 0x{0:04X}")]
    InvalidMask(u16),
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),
    #[error("table {0} is read-only over the wire")]
    ReadOnlyTable(PrimaryTable),

    #[error("register file line {line}: {message}")]
    Config { line: usize, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ModbusError {
    pub(crate) fn invalid_value(value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
