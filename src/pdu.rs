//! Function-code level encoding and decoding.
//!
//! Requests are decoded on the server side into [`Request`] with every field
//! range checked; a violation comes back as the [`ExceptionCode`] the reply
//! must carry. The client side encodes requests and decodes the matching
//! [`Response`], checking that the reply belongs to the request.

use crate::error::ModbusError;
use crate::exception::{ExceptionCode, EXCEPTION_FLAG};
use crate::table::PrimaryTable;

pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 2000;
pub const MAX_WRITE_REGISTERS: u16 = 120;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl FunctionCode {
    #[must_use]
    pub const fn new(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
        }
    }

    #[must_use]
    pub const fn table(self) -> PrimaryTable {
        match self {
            Self::ReadCoils | Self::WriteSingleCoil | Self::WriteMultipleCoils => PrimaryTable::Coil,
            Self::ReadDiscreteInputs => PrimaryTable::DiscreteInput,
            Self::ReadHoldingRegisters | Self::WriteSingleRegister | Self::WriteMultipleRegisters => {
                PrimaryTable::HoldingRegister
            }
            Self::ReadInputRegisters => PrimaryTable::InputRegister,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, count: u16 },
    ReadDiscreteInputs { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    #[must_use]
    pub const fn table(&self) -> PrimaryTable {
        self.function_code().table()
    }

    #[must_use]
    pub const fn address(&self) -> u16 {
        match self {
            Self::ReadCoils { address, .. }
            | Self::ReadDiscreteInputs { address, .. }
            | Self::ReadHoldingRegisters { address, .. }
            | Self::ReadInputRegisters { address, .. }
            | Self::WriteSingleCoil { address, .. }
            | Self::WriteSingleRegister { address, .. }
            | Self::WriteMultipleCoils { address, .. }
            | Self::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    /// Number of bits or registers addressed.
    #[must_use]
    pub fn count(&self) -> u16 {
        match self {
            Self::ReadCoils { count, .. }
            | Self::ReadDiscreteInputs { count, .. }
            | Self::ReadHoldingRegisters { count, .. }
            | Self::ReadInputRegisters { count, .. } => *count,
            Self::WriteSingleCoil { .. } | Self::WriteSingleRegister { .. } => 1,
            Self::WriteMultipleCoils { values, .. } => values.len() as u16,
            Self::WriteMultipleRegisters { values, .. } => values.len() as u16,
        }
    }

    /// Decode a request PDU (function code first).
    ///
    /// # Errors
    ///
    /// The exception code the server must answer with: `IllegalFunction` for
    /// unknown function codes, `IllegalDataValue` for bad counts, byte counts,
    /// coil values or truncated PDUs, `IllegalDataAddress` when the span runs
    /// past 65535.
    pub fn decode(pdu: &[u8]) -> Result<Self, ExceptionCode> {
        let Some(&code) = pdu.first() else {
            return Err(ExceptionCode::IllegalFunction);
        };
        let fc = FunctionCode::new(code).ok_or(ExceptionCode::IllegalFunction)?;
        if pdu.len() < 5 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let field = u16::from_be_bytes([pdu[3], pdu[4]]);
        let req = match fc {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => {
                if pdu.len() != 5 {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let max = match fc {
                    FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => MAX_READ_BITS,
                    _ => MAX_READ_REGISTERS,
                };
                check_span(address, field, max)?;
                match fc {
                    FunctionCode::ReadCoils => Self::ReadCoils { address, count: field },
                    FunctionCode::ReadDiscreteInputs => Self::ReadDiscreteInputs { address, count: field },
                    FunctionCode::ReadHoldingRegisters => Self::ReadHoldingRegisters { address, count: field },
                    _ => Self::ReadInputRegisters { address, count: field },
                }
            }
            FunctionCode::WriteSingleCoil => {
                if pdu.len() != 5 {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let value = match field {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(ExceptionCode::IllegalDataValue),
                };
                Self::WriteSingleCoil { address, value }
            }
            FunctionCode::WriteSingleRegister => {
                if pdu.len() != 5 {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                Self::WriteSingleRegister { address, value: field }
            }
            FunctionCode::WriteMultipleCoils => {
                let data = multi_write_payload(pdu, field, MAX_WRITE_BITS, usize::from(field).div_ceil(8))?;
                check_span(address, field, MAX_WRITE_BITS)?;
                Self::WriteMultipleCoils {
                    address,
                    values: unpack_bits(data, usize::from(field)),
                }
            }
            FunctionCode::WriteMultipleRegisters => {
                let data = multi_write_payload(pdu, field, MAX_WRITE_REGISTERS, usize::from(field) * 2)?;
                check_span(address, field, MAX_WRITE_REGISTERS)?;
                Self::WriteMultipleRegisters {
                    address,
                    values: data
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                }
            }
        };
        Ok(req)
    }

    /// Check the limits a server would enforce, before anything is sent.
    ///
    /// # Errors
    ///
    /// `ModbusError::Protocol` naming the violated limit.
    pub fn validate(&self) -> Result<(), ModbusError> {
        let (max, count) = match self {
            Self::ReadCoils { count, .. } | Self::ReadDiscreteInputs { count, .. } => (MAX_READ_BITS, *count),
            Self::ReadHoldingRegisters { count, .. } | Self::ReadInputRegisters { count, .. } => {
                (MAX_READ_REGISTERS, *count)
            }
            Self::WriteSingleCoil { .. } | Self::WriteSingleRegister { .. } => return Ok(()),
            Self::WriteMultipleCoils { values, .. } => (MAX_WRITE_BITS, clamp_len(values.len())),
            Self::WriteMultipleRegisters { values, .. } => (MAX_WRITE_REGISTERS, clamp_len(values.len())),
        };
        check_span(self.address(), count, max).map_err(|e| {
            ModbusError::Protocol(format!(
                "{:?} at {} x{count}: {}",
                self.function_code(),
                self.address(),
                e.name()
            ))
        })
    }

    /// Encode the request PDU.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.function_code().value()];
        out.extend_from_slice(&self.address().to_be_bytes());
        match self {
            Self::ReadCoils { count, .. }
            | Self::ReadDiscreteInputs { count, .. }
            | Self::ReadHoldingRegisters { count, .. }
            | Self::ReadInputRegisters { count, .. } => out.extend_from_slice(&count.to_be_bytes()),
            Self::WriteSingleCoil { value, .. } => {
                let v = if *value { COIL_ON } else { COIL_OFF };
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::WriteSingleRegister { value, .. } => out.extend_from_slice(&value.to_be_bytes()),
            Self::WriteMultipleCoils { values, .. } => {
                let packed = pack_bits(values);
                out.extend_from_slice(&self.count().to_be_bytes());
                out.push(packed.len() as u8);
                out.extend_from_slice(&packed);
            }
            Self::WriteMultipleRegisters { values, .. } => {
                out.extend_from_slice(&self.count().to_be_bytes());
                out.push((values.len() * 2) as u8);
                for v in values {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, count: u16 },
    WriteMultipleRegisters { address: u16, count: u16 },
}

impl Response {
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils(_) => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs(_) => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters(_) => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Encode the response PDU.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.function_code().value()];
        match self {
            Self::ReadCoils(bits) | Self::ReadDiscreteInputs(bits) => {
                let packed = pack_bits(bits);
                out.push(packed.len() as u8);
                out.extend_from_slice(&packed);
            }
            Self::ReadHoldingRegisters(words) | Self::ReadInputRegisters(words) => {
                out.push((words.len() * 2) as u8);
                for w in words {
                    out.extend_from_slice(&w.to_be_bytes());
                }
            }
            Self::WriteSingleCoil { address, value } => {
                out.extend_from_slice(&address.to_be_bytes());
                let v = if *value { COIL_ON } else { COIL_OFF };
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::WriteSingleRegister { address, value } => {
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&value.to_be_bytes());
            }
            Self::WriteMultipleCoils { address, count } | Self::WriteMultipleRegisters { address, count } => {
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
            }
        }
        out
    }

    /// Decode the reply PDU to `request`.
    ///
    /// # Errors
    ///
    /// `ModbusError::Exception` for an exception reply, `ImproperResponse`
    /// when the function code, byte count or echoed fields do not match the
    /// request.
    pub fn decode(request: &Request, pdu: &[u8]) -> Result<Self, ModbusError> {
        let fc = request.function_code().value();
        let Some(&code) = pdu.first() else {
            return Err(ModbusError::ImproperResponse("empty PDU".into()));
        };
        if code == fc | EXCEPTION_FLAG {
            let ex = pdu
                .get(1)
                .copied()
                .ok_or_else(|| ModbusError::ImproperResponse("exception without code".into()))?;
            return Err(ModbusError::Exception(ExceptionCode::from(ex)));
        }
        if code != fc {
            return Err(ModbusError::ImproperResponse(format!(
                "function code 0x{code:02X}, expected 0x{fc:02X}"
            )));
        }
        let count = usize::from(request.count());
        let resp = match request {
            Request::ReadCoils { .. } | Request::ReadDiscreteInputs { .. } => {
                let data = read_payload(pdu, count.div_ceil(8))?;
                let bits = unpack_bits(data, count);
                if matches!(request, Request::ReadCoils { .. }) {
                    Self::ReadCoils(bits)
                } else {
                    Self::ReadDiscreteInputs(bits)
                }
            }
            Request::ReadHoldingRegisters { .. } | Request::ReadInputRegisters { .. } => {
                let data = read_payload(pdu, count * 2)?;
                let words = data
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                if matches!(request, Request::ReadHoldingRegisters { .. }) {
                    Self::ReadHoldingRegisters(words)
                } else {
                    Self::ReadInputRegisters(words)
                }
            }
            _ => {
                if pdu.len() != 5 {
                    return Err(ModbusError::ImproperResponse(format!(
                        "write reply is {} bytes, expected 5",
                        pdu.len()
                    )));
                }
                let address = u16::from_be_bytes([pdu[1], pdu[2]]);
                let field = u16::from_be_bytes([pdu[3], pdu[4]]);
                let resp = match request {
                    Request::WriteSingleCoil { .. } => Self::WriteSingleCoil {
                        address,
                        value: field == COIL_ON,
                    },
                    Request::WriteSingleRegister { .. } => Self::WriteSingleRegister { address, value: field },
                    Request::WriteMultipleCoils { .. } => Self::WriteMultipleCoils { address, count: field },
                    _ => Self::WriteMultipleRegisters { address, count: field },
                };
                if !resp.echoes(request) {
                    return Err(ModbusError::ImproperResponse(format!(
                        "write reply does not echo the request: {resp:?}"
                    )));
                }
                resp
            }
        };
        Ok(resp)
    }

    fn echoes(&self, request: &Request) -> bool {
        match (self, request) {
            (Self::WriteSingleCoil { address, value }, Request::WriteSingleCoil { address: a, value: v }) => {
                address == a && value == v
            }
            (Self::WriteSingleRegister { address, value }, Request::WriteSingleRegister { address: a, value: v }) => {
                address == a && value == v
            }
            (Self::WriteMultipleCoils { address, count }, Request::WriteMultipleCoils { .. })
            | (Self::WriteMultipleRegisters { address, count }, Request::WriteMultipleRegisters { .. }) => {
                *address == request.address() && *count == request.count()
            }
            _ => false,
        }
    }
}

/// Exception reply PDU for function code `fc`.
#[must_use]
pub fn exception_pdu(fc: u8, code: ExceptionCode) -> Vec<u8> {
    vec![fc | EXCEPTION_FLAG, code.code()]
}

/// Pack bits LSB first, eight per byte.
#[must_use]
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, &b) in bits.iter().enumerate() {
        if b {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Inverse of [`pack_bits`]; `count` may be smaller than `bytes.len() * 8`.
#[must_use]
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|byte| (byte >> (i % 8)) & 0x01 != 0))
        .collect()
}

fn clamp_len(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn check_span(address: u16, count: u16, max: u16) -> Result<(), ExceptionCode> {
    if count == 0 || count > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if u32::from(address) + u32::from(count) > 0x1_0000 {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

// FC15/FC16 layout: fc, address(2), count(2), byte count(1), data
fn multi_write_payload(pdu: &[u8], count: u16, max: u16, expected_bytes: usize) -> Result<&[u8], ExceptionCode> {
    if count == 0 || count > max || pdu.len() < 6 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let byte_count = usize::from(pdu[5]);
    if byte_count != expected_bytes || pdu.len() != 6 + byte_count {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(&pdu[6..])
}

fn read_payload(pdu: &[u8], expected_bytes: usize) -> Result<&[u8], ModbusError> {
    let byte_count = pdu
        .get(1)
        .map(|b| usize::from(*b))
        .ok_or_else(|| ModbusError::ImproperResponse("missing byte count".into()))?;
    if byte_count != expected_bytes || pdu.len() != 2 + byte_count {
        return Err(ModbusError::ImproperResponse(format!(
            "byte count {byte_count} (pdu {} bytes), expected {expected_bytes}",
            pdu.len()
        )));
    }
    Ok(&pdu[2..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_read_holding() {
        let req = Request::decode(&[0x03, 0x00, 0xCD, 0x00, 0x02]).expect("decode");
        assert_eq!(req, Request::ReadHoldingRegisters { address: 205, count: 2 });
        assert_eq!(req.table(), PrimaryTable::HoldingRegister);
    }

    #[test]
    fn decode_count_limits() {
        assert_eq!(
            Request::decode(&[0x03, 0x00, 0x00, 0x00, 0x7E]),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert!(Request::decode(&[0x03, 0x00, 0x00, 0x00, 0x7D]).is_ok());
        assert_eq!(
            Request::decode(&[0x01, 0x00, 0x00, 0x07, 0xD1]),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            Request::decode(&[0x02, 0x00, 0x00, 0x00, 0x00]),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            Request::decode(&[0x04, 0xFF, 0xFF, 0x00, 0x02]),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn decode_unknown_function() {
        assert_eq!(Request::decode(&[0x2B, 0x0E, 0x01, 0x00]), Err(ExceptionCode::IllegalFunction));
        assert_eq!(Request::decode(&[]), Err(ExceptionCode::IllegalFunction));
    }

    #[test]
    fn decode_write_single_coil_values() {
        assert_eq!(
            Request::decode(&[0x05, 0x00, 0x03, 0xFF, 0x00]),
            Ok(Request::WriteSingleCoil { address: 3, value: true })
        );
        assert_eq!(
            Request::decode(&[0x05, 0x00, 0x03, 0x12, 0x34]),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn decode_write_multiple_coils_byte_count() {
        // 10 coils need 2 bytes
        let ok = [0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0b1100_1101, 0b0000_0001];
        let req = Request::decode(&ok).expect("decode");
        assert_eq!(
            req,
            Request::WriteMultipleCoils {
                address: 0,
                values: vec![true, false, true, true, false, false, true, true, true, false],
            }
        );
        let bad = [0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01, 0xCD];
        assert_eq!(Request::decode(&bad), Err(ExceptionCode::IllegalDataValue));
    }

    #[test]
    fn decode_write_multiple_registers() {
        let pdu = [0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02];
        let req = Request::decode(&pdu).expect("decode");
        assert_eq!(
            req,
            Request::WriteMultipleRegisters { address: 1, values: vec![0x000A, 0x0102] }
        );
        assert_eq!(req.encode(), pdu.to_vec());
        let too_many = [0x10, 0x00, 0x01, 0x00, 0x79, 0xF2];
        assert_eq!(Request::decode(&too_many), Err(ExceptionCode::IllegalDataValue));
    }

    #[test]
    fn response_encode_read_coils_lsb_first() {
        let r = Response::ReadCoils(vec![true, false, true, true, false, false, true, true, true, false]);
        assert_eq!(r.encode(), vec![0x01, 0x02, 0xCD, 0x01]);
    }

    #[test]
    fn response_decode_checks_request() {
        let req = Request::ReadHoldingRegisters { address: 0, count: 2 };
        let ok = Response::decode(&req, &[0x03, 0x04, 0x00, 0x01, 0x00, 0x02]).expect("decode");
        assert_eq!(ok, Response::ReadHoldingRegisters(vec![1, 2]));
        assert!(matches!(
            Response::decode(&req, &[0x03, 0x02, 0x00, 0x01]),
            Err(ModbusError::ImproperResponse(_))
        ));
        assert!(matches!(
            Response::decode(&req, &[0x04, 0x04, 0x00, 0x01, 0x00, 0x02]),
            Err(ModbusError::ImproperResponse(_))
        ));
        assert!(matches!(
            Response::decode(&req, &[0x83, 0x02]),
            Err(ModbusError::Exception(ExceptionCode::IllegalDataAddress))
        ));
    }

    #[test]
    fn response_decode_write_echo() {
        let req = Request::WriteSingleRegister { address: 7, value: 0x1234 };
        let pdu = req.encode();
        assert_eq!(
            Response::decode(&req, &pdu).expect("echo"),
            Response::WriteSingleRegister { address: 7, value: 0x1234 }
        );
        assert!(Response::decode(&req, &[0x06, 0x00, 0x07, 0x12, 0x35]).is_err());
    }

    #[test]
    fn validate_rejects_oversized_requests() {
        let req = Request::WriteMultipleRegisters { address: 0, values: vec![0; 121] };
        assert!(req.validate().is_err());
        let req = Request::ReadCoils { address: 65535, count: 2 };
        assert!(req.validate().is_err());
        assert!(Request::ReadCoils { address: 0, count: 2000 }.validate().is_ok());
    }
}
