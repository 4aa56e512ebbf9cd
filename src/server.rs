//! Request execution against a [`RegisterStore`].

use crate::config::config as global_config;
use crate::error::ModbusError;
use crate::exception::ExceptionCode;
use crate::mbap::{build_frame, hex_dump, split_frames, MbapHeader, MBAP_HEADER_LEN};
use crate::pdu::{exception_pdu, Request, Response};
use crate::store::RegisterStore;

/// Turns raw request bytes into raw response bytes. Stateless apart from the
/// shared store, so one engine can serve any number of connections.
#[derive(Debug, Clone)]
pub struct ServerEngine {
    store: RegisterStore,
}

impl ServerEngine {
    #[must_use]
    pub const fn new(store: RegisterStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub const fn store(&self) -> &RegisterStore {
        &self.store
    }

    /// Serve every frame in `raw` and return the concatenated responses in
    /// arrival order.
    ///
    /// An empty result means a header could not be parsed (or its length
    /// field disagrees with the bytes present). Nothing in `raw` has been
    /// executed in that case and the caller must drop the connection.
    #[must_use]
    pub fn handle(&self, raw: &[u8]) -> Vec<u8> {
        let frames = match split_frames(raw) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("dropping {} byte request: {e}", raw.len());
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for frame in frames {
            match MbapHeader::parse(frame) {
                Ok(hdr) => out.extend_from_slice(&self.handle_frame(hdr, &frame[MBAP_HEADER_LEN..])),
                Err(e) => {
                    // split_frames already parsed every header
                    log::error!("header re-parse failed: {e}");
                    return Vec::new();
                }
            }
        }
        out
    }

    fn handle_frame(&self, hdr: MbapHeader, pdu: &[u8]) -> Vec<u8> {
        if global_config().log_frames {
            log::debug!(
                "[MODBUS server recv] tid={} {}",
                hdr.transaction_id,
                hex_dump(pdu)
            );
        }
        let fc = pdu.first().copied().unwrap_or(0);
        let reply = match Request::decode(pdu) {
            Ok(req) => match self.execute(&req) {
                Ok(resp) => resp.encode(),
                Err(code) => {
                    log::debug!("{req:?} -> exception {code}");
                    exception_pdu(fc, code)
                }
            },
            Err(code) => {
                log::debug!("undecodable PDU fc=0x{fc:02X} -> exception {code}");
                exception_pdu(fc, code)
            }
        };
        if global_config().log_frames {
            log::debug!(
                "[MODBUS server send] tid={} {}",
                hdr.transaction_id,
                hex_dump(&reply)
            );
        }
        build_frame(hdr.transaction_id, hdr.unit_id, &reply)
    }

    /// Apply one decoded request to the store.
    ///
    /// # Errors
    ///
    /// The exception code to answer with; the store is unchanged.
    pub fn execute(&self, req: &Request) -> Result<Response, ExceptionCode> {
        let table = req.table();
        let address = req.address();
        let resp = match req {
            Request::ReadCoils { count, .. } => {
                Response::ReadCoils(self.store.read_bits(table, address, *count).map_err(to_exception)?)
            }
            Request::ReadDiscreteInputs { count, .. } => Response::ReadDiscreteInputs(
                self.store.read_bits(table, address, *count).map_err(to_exception)?,
            ),
            Request::ReadHoldingRegisters { count, .. } => Response::ReadHoldingRegisters(
                self.store.read_words(table, address, *count).map_err(to_exception)?,
            ),
            Request::ReadInputRegisters { count, .. } => Response::ReadInputRegisters(
                self.store.read_words(table, address, *count).map_err(to_exception)?,
            ),
            Request::WriteSingleCoil { value, .. } => {
                self.store.write_bits(table, address, &[*value]).map_err(to_exception)?;
                Response::WriteSingleCoil { address, value: *value }
            }
            Request::WriteSingleRegister { value, .. } => {
                self.store.write_words(table, address, &[*value]).map_err(to_exception)?;
                Response::WriteSingleRegister { address, value: *value }
            }
            Request::WriteMultipleCoils { values, .. } => {
                self.store.write_bits(table, address, values).map_err(to_exception)?;
                Response::WriteMultipleCoils { address, count: req.count() }
            }
            Request::WriteMultipleRegisters { values, .. } => {
                self.store.write_words(table, address, values).map_err(to_exception)?;
                Response::WriteMultipleRegisters { address, count: req.count() }
            }
        };
        Ok(resp)
    }
}

fn to_exception(e: ModbusError) -> ExceptionCode {
    match e {
        ModbusError::Exception(code) => code,
        other => {
            log::error!("store failure while serving request: {other}");
            ExceptionCode::ServerDeviceFailure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntryDefinition;
    use crate::table::PrimaryTable;
    use crate::value_format::DisplayFormat;

    fn engine() -> ServerEngine {
        let store = RegisterStore::new();
        let hr = PrimaryTable::HoldingRegister;
        store
            .define(hr, 205, EntryDefinition::new("MyFloat", DisplayFormat::Float).with_value("-3.14159"))
            .unwrap();
        store.define(hr, 0, EntryDefinition::new("Speed", DisplayFormat::Uint)).unwrap();
        for a in 0..10u16 {
            store
                .define(PrimaryTable::Coil, a, EntryDefinition::new(format!("c{a}"), DisplayFormat::Bool))
                .unwrap();
        }
        ServerEngine::new(store)
    }

    #[test]
    fn read_composite_float() {
        let e = engine();
        let req = build_frame(1, 1, &[0x03, 0x00, 0xCD, 0x00, 0x02]);
        let resp = e.handle(&req);
        assert_eq!(&resp[..7], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01]);
        assert_eq!(resp[7], 0x03);
        assert_eq!(resp[8], 4);
        let words = [
            u16::from_be_bytes([resp[9], resp[10]]),
            u16::from_be_bytes([resp[11], resp[12]]),
        ];
        assert_eq!(DisplayFormat::Float.format_words(&words).unwrap(), "-3.14159");
    }

    #[test]
    fn unmapped_write_is_illegal_address() {
        let e = engine();
        let resp = e.handle(&build_frame(9, 1, &[0x06, 0x00, 0x63, 0x00, 0x01]));
        assert_eq!(resp, build_frame(9, 1, &[0x86, 0x02]));
        assert_eq!(resp[5], 3);
    }

    #[test]
    fn unknown_function_and_bad_byte_count() {
        let e = engine();
        let resp = e.handle(&build_frame(2, 1, &[0x07]));
        assert_eq!(resp, build_frame(2, 1, &[0x87, 0x01]));
        let resp = e.handle(&build_frame(3, 1, &[0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01, 0xFF]));
        assert_eq!(resp, build_frame(3, 1, &[0x8F, 0x03]));
    }

    #[test]
    fn write_multiple_coils_then_read() {
        let e = engine();
        let resp = e.handle(&build_frame(4, 1, &[0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0xCD, 0x01]));
        assert_eq!(resp, build_frame(4, 1, &[0x0F, 0x00, 0x00, 0x00, 0x0A]));
        assert_eq!(e.store().get(PrimaryTable::Coil, "c0").unwrap(), "1");
        assert_eq!(e.store().get(PrimaryTable::Coil, "c1").unwrap(), "0");
        let resp = e.handle(&build_frame(5, 1, &[0x01, 0x00, 0x00, 0x00, 0x0A]));
        assert_eq!(resp, build_frame(5, 1, &[0x01, 0x02, 0xCD, 0x01]));
    }

    #[test]
    fn coalesced_frames_answered_in_order() {
        let e = engine();
        let mut raw = build_frame(10, 1, &[0x06, 0x00, 0x00, 0x00, 0x2A]);
        raw.extend_from_slice(&build_frame(11, 1, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        let resp = e.handle(&raw);
        let mut expected = build_frame(10, 1, &[0x06, 0x00, 0x00, 0x00, 0x2A]);
        expected.extend_from_slice(&build_frame(11, 1, &[0x03, 0x02, 0x00, 0x2A]));
        assert_eq!(resp, expected);
    }

    #[test]
    fn length_mismatch_executes_nothing() {
        let e = engine();
        let mut raw = build_frame(1, 1, &[0x06, 0x00, 0x00, 0x00, 0x07]);
        raw[5] = 0x09;
        assert!(e.handle(&raw).is_empty());
        // a valid frame followed by a broken one: neither is executed
        let mut raw = build_frame(1, 1, &[0x06, 0x00, 0x00, 0x00, 0x07]);
        raw.extend_from_slice(&[0x00, 0x02, 0x00, 0x01]);
        assert!(e.handle(&raw).is_empty());
        assert_eq!(e.store().get(PrimaryTable::HoldingRegister, "Speed").unwrap(), "0");
    }
}
