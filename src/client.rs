//! Client engine: a local register mirror kept in sync with a remote server.
//!
//! `local_value`/`set_local_value` only touch the mirror. `remote_value` and
//! `set_remote_value` do a network round trip and, on success, update the
//! mirror exactly as the server updated its own store.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::config as global_config;
use crate::endpoint::ConnectionTarget;
use crate::error::ModbusError;
use crate::mbap::{build_frame, MbapHeader, MBAP_HEADER_LEN};
use crate::pdu::{Request, Response};
use crate::store::{Location, RegisterStore};
use crate::table::PrimaryTable;
use crate::transport::Connection;

#[derive(Debug)]
pub struct ModbusClient {
    store: RegisterStore,
    target: ConnectionTarget,
    timeout: Duration,
    next_tid: AtomicU16,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl ModbusClient {
    #[must_use]
    pub fn new(store: RegisterStore, target: ConnectionTarget) -> Self {
        Self {
            store,
            target,
            timeout: global_config().response_timeout(),
            next_tid: AtomicU16::new(1),
            conn: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.target.unit_id = unit_id;
        self
    }

    #[must_use]
    pub const fn store(&self) -> &RegisterStore {
        &self.store
    }

    #[must_use]
    pub const fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    fn next_transaction_id(&self) -> u16 {
        // wraps 0xFFFF -> 0
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Connect (or reconnect) to the target, retrying with backoff.
    ///
    /// # Errors
    ///
    /// The last connect error once every attempt failed.
    pub async fn connect(&self) -> Result<(), ModbusError> {
        let conn = Connection::open_with_retry(&self.target, global_config()).await?;
        log::info!("connected to {} ({})", self.target.addr, conn.peer());
        let old = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::new(conn));
        if let Some(old) = old {
            old.close();
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        let old = self.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = old {
            conn.close();
            log::info!("disconnected from {}", self.target.addr);
        }
    }

    #[must_use]
    pub fn server_available(&self) -> bool {
        self.current().is_some_and(|c| c.is_alive())
    }

    /// Value of `name` in the local mirror.
    ///
    /// # Errors
    ///
    /// `UnknownEntry` for names not in `table`.
    pub fn local_value(&self, table: PrimaryTable, name: &str) -> Result<String, ModbusError> {
        self.store.get(table, name)
    }

    /// Store `text` in the local mirror only. Returns the changed item names.
    ///
    /// # Errors
    ///
    /// `UnknownEntry`, or a parse error leaving the mirror unchanged.
    pub fn set_local_value(&self, table: PrimaryTable, name: &str, text: &str) -> Result<Vec<String>, ModbusError> {
        self.store.set(table, name, text)
    }

    /// Read `name` from the server, update the mirror and return the fresh
    /// formatted value.
    ///
    /// # Errors
    ///
    /// `UnknownEntry`, `NoConnection`, `Timeout`, `ImproperResponse` or the
    /// server's `Exception`. The mirror is untouched on any error.
    pub async fn remote_value(&self, table: PrimaryTable, name: &str) -> Result<String, ModbusError> {
        let loc = self.store.resolve(table, name)?;
        let conn = self.connection()?;
        let count = u16::try_from(loc.words).unwrap_or(1);
        let words = self.fetch(&conn, table, loc.address, count).await?;
        self.store.write_words(table, loc.address, &words)?;
        self.store.get(table, name)
    }

    /// Write `text` to the server and, once acknowledged, to the mirror.
    ///
    /// A masked secondary item is written read-modify-write: the primary
    /// word is fetched (FC3), the field merged in, and the word written back
    /// (FC6).
    ///
    /// # Errors
    ///
    /// `ReadOnlyTable` for discrete inputs and input registers, parse errors
    /// before any I/O, then the errors of [`Self::remote_value`].
    pub async fn set_remote_value(&self, table: PrimaryTable, name: &str, text: &str) -> Result<String, ModbusError> {
        let loc = self.store.resolve(table, name)?;
        if !table.is_writable() {
            return Err(ModbusError::ReadOnlyTable(table));
        }
        if loc.is_secondary() {
            return self.set_remote_secondary(&loc, name, text).await;
        }
        let words = loc.format.parse_words(text)?;
        let conn = self.connection()?;
        let req = match table {
            PrimaryTable::Coil => Request::WriteSingleCoil {
                address: loc.address,
                value: words.first().is_some_and(|w| *w != 0),
            },
            _ if words.len() == 1 => Request::WriteSingleRegister {
                address: loc.address,
                value: words[0],
            },
            _ => Request::WriteMultipleRegisters {
                address: loc.address,
                values: words.clone(),
            },
        };
        self.round_trip(&conn, &req).await?;
        self.store.write_words(table, loc.address, &words)?;
        self.store.get(table, name)
    }

    async fn set_remote_secondary(&self, loc: &Location, name: &str, text: &str) -> Result<String, ModbusError> {
        let entry = self
            .store
            .entry(loc.table, loc.address)
            .ok_or_else(|| ModbusError::UnknownEntry(format!("{}:{name}", loc.table)))?;
        let item = entry
            .items
            .get(loc.item)
            .ok_or_else(|| ModbusError::UnknownEntry(format!("{}:{name}", loc.table)))?;
        let field = loc.format.parse_words(text)?[0];
        if !item.fits(field) {
            return Err(ModbusError::invalid_value(
                text,
                format!("does not fit mask 0x{:04X}", loc.mask),
            ));
        }
        let conn = self.connection()?;
        let current = self.fetch(&conn, loc.table, loc.address, 1).await?;
        self.store.write_words(loc.table, loc.address, &current)?;
        let merged = item.merge(current[0], field);
        let req = Request::WriteSingleRegister {
            address: loc.address,
            value: merged,
        };
        self.round_trip(&conn, &req).await?;
        self.store.write_words(loc.table, loc.address, &[merged])?;
        self.store.get(loc.table, name)
    }

    fn connection(&self) -> Result<Arc<Connection>, ModbusError> {
        self.current()
            .filter(|c| c.is_alive())
            .ok_or(ModbusError::NoConnection)
    }

    async fn fetch(&self, conn: &Connection, table: PrimaryTable, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        let req = match table {
            PrimaryTable::Coil => Request::ReadCoils { address, count },
            PrimaryTable::DiscreteInput => Request::ReadDiscreteInputs { address, count },
            PrimaryTable::InputRegister => Request::ReadInputRegisters { address, count },
            PrimaryTable::HoldingRegister => Request::ReadHoldingRegisters { address, count },
        };
        let words = match self.round_trip(conn, &req).await? {
            Response::ReadCoils(bits) | Response::ReadDiscreteInputs(bits) => {
                bits.into_iter().map(u16::from).collect()
            }
            Response::ReadHoldingRegisters(words) | Response::ReadInputRegisters(words) => words,
            other => {
                return Err(ModbusError::ImproperResponse(format!(
                    "read answered with {other:?}"
                )))
            }
        };
        Ok(words)
    }

    /// Send one request and decode the reply belonging to it.
    async fn round_trip(&self, conn: &Connection, req: &Request) -> Result<Response, ModbusError> {
        req.validate()?;
        let tid = self.next_transaction_id();
        let frame = build_frame(tid, self.target.unit_id, &req.encode());
        let reply = conn.request(tid, &frame, self.timeout).await?;
        let hdr = MbapHeader::parse(&reply)?;
        if hdr.transaction_id != tid {
            return Err(ModbusError::ImproperResponse(format!(
                "transaction id {} answered {tid}",
                hdr.transaction_id
            )));
        }
        let resp = Response::decode(req, &reply[MBAP_HEADER_LEN..]);
        if let Err(ModbusError::Exception(code)) = &resp {
            log::debug!("{req:?} rejected by server: {code}");
        }
        resp
    }
}

impl Drop for ModbusClient {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            conn.close();
        }
    }
}
