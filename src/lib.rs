#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::doc_markdown,
    clippy::too_long_first_doc_paragraph,
    clippy::cast_possible_truncation
)]

//! modbus_engine
//!
//! A Modbus/TCP engine for both roles of the protocol:
//! - a register store of the four primary tables with named items, bit-masked
//!   sub-fields and multi-word composite values (`store`)
//! - the MBAP/PDU codec for function codes 1-6, 15 and 16 (`mbap`, `pdu`)
//! - a server engine plus TCP listener serving the store (`server`, `listener`)
//! - a client engine mirroring a remote server into a local store (`client`)
//! - a loader for the semicolon separated register file (`register_file`)
//!
//! ```no_run
//! use modbus_engine::{ModbusServer, PrimaryTable, RegisterFile};
//! # async fn demo() -> Result<(), modbus_engine::ModbusError> {
//! let file = RegisterFile::from_str("40206;2;FFFF;MyFloat;;Float;-3.14159")?;
//! let server = ModbusServer::new(file.build_store()?);
//! server.start(file.port).await?;
//! assert_eq!(server.store().get(PrimaryTable::HoldingRegister, "MyFloat")?, "-3.14159");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod exception;
pub mod listener;
pub mod mbap;
pub mod pdu;
pub mod register;
pub mod register_file;
pub mod server;
pub mod store;
pub mod table;
pub mod transport;
pub mod value_format;

pub use client::ModbusClient;
pub use endpoint::ConnectionTarget;
pub use error::ModbusError;
pub use exception::ExceptionCode;
pub use listener::{ConnectionState, ListenerState, ModbusServer};
pub use register_file::RegisterFile;
pub use server::ServerEngine;
pub use store::{ChangeEvent, EntryDefinition, RegisterAccess, RegisterStore};
pub use table::PrimaryTable;
pub use value_format::DisplayFormat;
