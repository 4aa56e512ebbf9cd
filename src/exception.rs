//! Modbus exception codes carried in exception responses.
//!
//! The server only ever produces the first three codes; the remaining ones
//! are recognised when decoding a peer's reply so they can be reported by
//! name instead of as a bare number.

use std::fmt;

/// Function code bit set in an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Other(u8),
}

impl ExceptionCode {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailedToRespond => 0x0B,
            Self::Other(c) => c,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::IllegalFunction => "ILLEGAL FUNCTION",
            Self::IllegalDataAddress => "ILLEGAL DATA ADDRESS",
            Self::IllegalDataValue => "ILLEGAL DATA VALUE",
            Self::ServerDeviceFailure => "SERVER DEVICE FAILURE",
            Self::Acknowledge => "ACKNOWLEDGE",
            Self::ServerDeviceBusy => "SERVER DEVICE BUSY",
            Self::MemoryParityError => "MEMORY PARITY ERROR",
            Self::GatewayPathUnavailable => "GATEWAY PATH UNAVAILABLE",
            Self::GatewayTargetFailedToRespond => "GATEWAY TARGET DEVICE FAILED TO RESPOND",
            Self::Other(_) => "UNKNOWN EXCEPTION",
        }
    }

    /// Short human readable description, used in log lines and error messages.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "function code not supported by the server",
            Self::IllegalDataAddress => "at least one address in the requested span is not mapped",
            Self::IllegalDataValue => "a field in the request is out of range or inconsistent",
            Self::ServerDeviceFailure => "unrecoverable error while performing the action",
            Self::Acknowledge => "request accepted, processing takes a long time",
            Self::ServerDeviceBusy => "server is busy processing a long-duration command",
            Self::MemoryParityError => "parity error in extended memory",
            Self::GatewayPathUnavailable => "gateway could not allocate a path",
            Self::GatewayTargetFailedToRespond => "no response from the gateway target",
            Self::Other(_) => "exception code not defined by the Modbus specification",
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailedToRespond,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} {} ({})", self.code(), self.name(), self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_roundtrip() {
        for c in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x08, 0x0A, 0x0B] {
            assert_eq!(ExceptionCode::from(c).code(), c);
        }
    }

    #[test]
    fn unknown_code_is_kept() {
        let e = ExceptionCode::from(0x42);
        assert_eq!(e, ExceptionCode::Other(0x42));
        assert_eq!(e.code(), 0x42);
        assert!(e.to_string().starts_with("0x42"));
    }
}
