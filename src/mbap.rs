use crate::error::ModbusError;

/// Size of the MBAP header including the unit id.
pub const MBAP_HEADER_LEN: usize = 7;
/// Largest length field a Modbus/TCP frame can carry (unit id + 253 byte PDU).
pub const MAX_LENGTH_FIELD: usize = 254;
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// The 7-byte Modbus Application Protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id + PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    #[must_use]
    pub const fn new(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    /// Parse the header at the start of `buf`.
    ///
    /// # Errors
    ///
    /// `MalformedHeader` when fewer than 7 bytes are present or the protocol
    /// id is not 0.
    pub fn parse(buf: &[u8]) -> Result<Self, ModbusError> {
        if buf.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::MalformedHeader(format!(
                "need {MBAP_HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let hdr = Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        };
        if hdr.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ModbusError::MalformedHeader(format!(
                "protocol id {} is not Modbus",
                hdr.protocol_id
            )));
        }
        Ok(hdr)
    }

    /// Total frame size implied by the length field.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        MBAP_HEADER_LEN - 1 + self.length as usize
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; MBAP_HEADER_LEN] {
        let t = self.transaction_id.to_be_bytes();
        let p = self.protocol_id.to_be_bytes();
        let l = self.length.to_be_bytes();
        [t[0], t[1], p[0], p[1], l[0], l[1], self.unit_id]
    }
}

/// Assemble a full frame from header fields and a PDU.
#[must_use]
pub fn build_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let hdr = MbapHeader::new(transaction_id, unit_id, pdu.len());
    let mut out = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    out.extend_from_slice(&hdr.to_bytes());
    out.extend_from_slice(pdu);
    out
}

/// Try to determine the size of the frame at the start of a stream buffer.
///
/// Returns `Ok(None)` while the header is still incomplete and
/// `Ok(Some(frame_len))` once the header is known, even if the buffer does
/// not yet hold the whole frame.
///
/// # Errors
///
/// Returns an error for a malformed header: wrong protocol id, or a length
/// field outside `2..=254`.
pub fn detect_frame(buf: &[u8]) -> Result<Option<usize>, ModbusError> {
    if buf.len() < MBAP_HEADER_LEN {
        return Ok(None);
    }
    let hdr = MbapHeader::parse(buf)?;
    let len = usize::from(hdr.length);
    if !(2..=MAX_LENGTH_FIELD).contains(&len) {
        return Err(ModbusError::MalformedHeader(format!(
            "length field {len} outside 2..={MAX_LENGTH_FIELD}"
        )));
    }
    Ok(Some(hdr.frame_len()))
}

/// Split a buffer holding one or more complete frames.
///
/// Several requests pipelined into one TCP segment come back as separate
/// slices in arrival order.
///
/// # Errors
///
/// `MalformedHeader` for a short or non-Modbus header and `InvalidLength`
/// when a length field is below 2 or claims more bytes than remain.
pub fn split_frames(buf: &[u8]) -> Result<Vec<&[u8]>, ModbusError> {
    let mut frames = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let hdr = MbapHeader::parse(rest)?;
        let declared = usize::from(hdr.length);
        let available = rest.len() - (MBAP_HEADER_LEN - 1);
        if declared < 2 || declared > available {
            return Err(ModbusError::InvalidLength {
                declared,
                available,
            });
        }
        let (frame, tail) = rest.split_at(hdr.frame_len());
        frames.push(frame);
        rest = tail;
    }
    Ok(frames)
}

pub(crate) fn hex_dump(b: &[u8]) -> String {
    b.iter()
        .map(|x| format!("{x:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
