//! Loader for the semicolon separated register definition file.
//!
//! ```text
//! # comment
//! HOST;192.168.0.10
//! PORT;502
//! INFO;boiler room
//! 40206;2;FFFF;MyFloat;setpoint;Float;-3.14159
//! 40101;1;FFFF;Status;;Hex;A5C3
//! 40101;0;00F0;Mode;;Uint;
//! ```
//!
//! Seven-field lines are `number;words;mask;name;comment;display;value`.
//! `FFFF` defines a primary entry (composite formats create their
//! continuation words), `0000` names a continuation word of a composite
//! defined above, any other mask carves a sub-field out of a primary defined
//! above.

use std::fs;
use std::path::Path;

use crate::endpoint::{ConnectionTarget, DEFAULT_PORT};
use crate::error::ModbusError;
use crate::register::{CONTINUATION_MASK, FULL_MASK};
use crate::store::{EntryDefinition, RegisterStore};
use crate::table::PrimaryTable;
use crate::value_format::DisplayFormat;

const ALLOWED_WORDS: [u8; 5] = [0, 1, 2, 4, 8];

/// One seven-field line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDefinition {
    /// 1-based line in the source text.
    pub line: usize,
    pub table: PrimaryTable,
    pub address: u16,
    pub words: u8,
    pub mask: u16,
    pub name: String,
    pub comment: String,
    pub format: DisplayFormat,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    /// Server to connect to in client mode.
    pub host: Option<String>,
    pub port: u16,
    pub info: Vec<String>,
    pub definitions: Vec<RegisterDefinition>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            info: Vec::new(),
            definitions: Vec::new(),
        }
    }
}

fn config_err(line: usize, message: impl Into<String>) -> ModbusError {
    ModbusError::Config {
        line,
        message: message.into(),
    }
}

impl RegisterFile {
    /// Parse register file text. Only the syntax of each line is checked
    /// here; cross-line rules are applied by [`Self::populate`].
    ///
    /// # Errors
    ///
    /// `ModbusError::Config` with the 1-based line number of the first bad
    /// line.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ModbusError> {
        let mut file = Self::default();
        for (idx, raw) in s.lines().enumerate() {
            let line = idx + 1;
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = raw.trim_end_matches('\r').split(';').collect();
            match fields.len() {
                2 => file.parse_setting(line, fields[0].trim(), fields[1].trim())?,
                7 => file.definitions.push(parse_definition(line, &fields)?),
                n => return Err(config_err(line, format!("expected 2 or 7 fields, got {n}"))),
            }
        }
        Ok(file)
    }

    /// # Errors
    ///
    /// `Io` when the file cannot be read, otherwise as [`Self::from_str`].
    pub fn from_path(path: &Path) -> Result<Self, ModbusError> {
        let s = fs::read_to_string(path)?;
        s.parse::<Self>()
    }

    fn parse_setting(&mut self, line: usize, key: &str, value: &str) -> Result<(), ModbusError> {
        match key.to_ascii_uppercase().as_str() {
            "HOST" => self.host = Some(value.to_string()),
            "PORT" => {
                self.port = value
                    .parse()
                    .map_err(|e| config_err(line, format!("bad port '{value}': {e}")))?;
            }
            "INFO" => self.info.push(value.to_string()),
            other => return Err(config_err(line, format!("unknown setting '{other}'"))),
        }
        Ok(())
    }

    /// Client target described by `HOST`/`PORT` (localhost when no host).
    #[must_use]
    pub fn target(&self) -> ConnectionTarget {
        let target = ConnectionTarget::new().with_port(self.port);
        match &self.host {
            Some(host) => target.with_host(host.clone()),
            None => target,
        }
    }

    /// Fresh store holding every definition.
    ///
    /// # Errors
    ///
    /// As [`Self::populate`].
    pub fn build_store(&self) -> Result<RegisterStore, ModbusError> {
        let store = RegisterStore::new();
        self.populate(&store)?;
        Ok(store)
    }

    /// Define every entry in `store`, in file order.
    ///
    /// # Errors
    ///
    /// `ModbusError::Config` naming the line whose definition was rejected
    /// (duplicate name or address, words not matching the display format, a
    /// sub-field or continuation without its primary, a bad initial value).
    pub fn populate(&self, store: &RegisterStore) -> Result<(), ModbusError> {
        for def in &self.definitions {
            apply_definition(store, def).map_err(|e| match e {
                ModbusError::Config { .. } => e,
                other => config_err(def.line, other.to_string()),
            })?;
        }
        log::debug!(
            "register file: {} definitions loaded",
            self.definitions.len()
        );
        Ok(())
    }
}

impl std::str::FromStr for RegisterFile {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str(s)
    }
}

fn parse_definition(line: usize, fields: &[&str]) -> Result<RegisterDefinition, ModbusError> {
    let number: u32 = fields[0]
        .trim()
        .parse()
        .map_err(|e| config_err(line, format!("bad register number '{}': {e}", fields[0].trim())))?;
    let (table, address) =
        PrimaryTable::from_register_number(number).map_err(|e| config_err(line, e.to_string()))?;
    let words: u8 = fields[1]
        .trim()
        .parse()
        .map_err(|e| config_err(line, format!("bad word count '{}': {e}", fields[1].trim())))?;
    if !ALLOWED_WORDS.contains(&words) {
        return Err(config_err(line, format!("word count {words} not in {ALLOWED_WORDS:?}")));
    }
    let mask_text = fields[2].trim();
    let mask_digits = mask_text
        .strip_prefix("0x")
        .or_else(|| mask_text.strip_prefix("0X"))
        .unwrap_or(mask_text);
    if mask_digits.is_empty() || mask_digits.len() > 4 {
        return Err(config_err(line, format!("bad mask '{mask_text}'")));
    }
    let mask = u16::from_str_radix(mask_digits, 16)
        .map_err(|e| config_err(line, format!("bad mask '{mask_text}': {e}")))?;
    let format: DisplayFormat = fields[5]
        .parse()
        .map_err(|e: ModbusError| config_err(line, e.to_string()))?;
    // text formats keep their spaces
    let value = match format {
        DisplayFormat::Ascii | DisplayFormat::Str8 | DisplayFormat::Str16 => fields[6].to_string(),
        _ => fields[6].trim().to_string(),
    };
    Ok(RegisterDefinition {
        line,
        table,
        address,
        words,
        mask,
        name: fields[3].trim().to_string(),
        comment: fields[4].trim().to_string(),
        format,
        value,
    })
}

fn apply_definition(store: &RegisterStore, def: &RegisterDefinition) -> Result<(), ModbusError> {
    let words = usize::from(def.words);
    match def.mask {
        FULL_MASK => {
            let expected = if def.table.is_bit_table() { 1 } else { def.format.words() };
            if words != expected {
                return Err(config_err(
                    def.line,
                    format!("{} needs {expected} word(s), line says {words}", def.format),
                ));
            }
            store.define(
                def.table,
                def.address,
                EntryDefinition::new(def.name.clone(), def.format)
                    .with_comment(def.comment.clone())
                    .with_value(def.value.clone()),
            )
        }
        CONTINUATION_MASK => {
            let inside = store
                .entry(def.table, def.address)
                .is_some_and(|e| e.is_continuation());
            if inside {
                Ok(())
            } else {
                Err(config_err(
                    def.line,
                    format!(
                        "continuation word at {} is not inside a composite defined above",
                        def.table.register_number(def.address)
                    ),
                ))
            }
        }
        mask => {
            if words > 1 {
                return Err(config_err(
                    def.line,
                    format!("sub-field '{}' must span 0 or 1 words", def.name),
                ));
            }
            let item = store.add_item(def.table, def.address, mask, &def.name, def.format)?;
            if def.value.trim().is_empty() {
                Ok(())
            } else {
                store.set_at(def.table, def.address, item, &def.value).map(|_| ())
            }
        }
    }
}
