//! The register store shared by the server and client engines.
//!
//! All four tables live behind one `RwLock`. Every operation takes the lock
//! exactly once, so a multi-word write (a composite value, or an FC16 request)
//! is observed by readers either completely or not at all. The lock is never
//! held across an `.await`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

use crate::error::ModbusError;
use crate::exception::ExceptionCode;
use crate::register::{RegisterEntry, RegisterItem};
use crate::table::PrimaryTable;
use crate::value_format::DisplayFormat;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Emitted once per primary entry whose effective value changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ChangeEvent {
    pub table: PrimaryTable,
    pub name: String,
}

/// What to create with [`RegisterStore::define`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDefinition {
    pub name: String,
    pub comment: String,
    pub format: DisplayFormat,
    /// Initial value in `format`; empty means all zero.
    pub value: String,
}

impl EntryDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, format: DisplayFormat) -> Self {
        Self {
            name: name.into(),
            comment: String::new(),
            format,
            value: String::new(),
        }
    }
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }
}

/// Where a named item lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub table: PrimaryTable,
    /// Address of the primary entry (the composite head for composites).
    pub address: u16,
    /// 0 for the primary value, otherwise the secondary item index.
    pub item: usize,
    pub mask: u16,
    pub format: DisplayFormat,
    /// Registers covered on the wire: 1, or the composite width.
    pub words: usize,
}

impl Location {
    #[must_use]
    pub const fn is_secondary(&self) -> bool {
        self.item > 0
    }
}

/// Narrow read/write interface for automation code that only knows names.
pub trait RegisterAccess {
    fn value(&self, table: PrimaryTable, name: &str) -> Result<String, ModbusError>;
    fn set_value(&self, table: PrimaryTable, name: &str, text: &str) -> Result<(), ModbusError>;
}

#[derive(Debug, Default)]
struct RegisterTable {
    entries: BTreeMap<u16, RegisterEntry>,
    names: HashMap<String, (u16, usize)>,
}

#[derive(Debug, Default)]
struct Tables {
    tables: [RegisterTable; 4],
}

impl Tables {
    fn get(&self, table: PrimaryTable) -> &RegisterTable {
        &self.tables[table.index()]
    }
    fn get_mut(&mut self, table: PrimaryTable) -> &mut RegisterTable {
        &mut self.tables[table.index()]
    }
}

#[derive(Debug, Default)]
struct Changes {
    items: Vec<String>,
    events: Vec<ChangeEvent>,
}

impl Changes {
    fn push_item(&mut self, name: &str) {
        if !name.is_empty() && !self.items.iter().any(|n| n == name) {
            self.items.push(name.to_string());
        }
    }
    fn push_event(&mut self, table: PrimaryTable, name: &str) {
        if !name.is_empty() && !self.events.iter().any(|e| e.name == name) {
            self.events.push(ChangeEvent {
                table,
                name: name.to_string(),
            });
        }
    }
}

/// Cloneable handle to the shared register tables.
#[derive(Debug, Clone)]
pub struct RegisterStore {
    inner: Arc<RwLock<Tables>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Tables::default())),
            events,
        }
    }

    /// Receive a [`ChangeEvent`] for every later mutation.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: &[ChangeEvent]) {
        for ev in events {
            // no subscriber is not an error
            let _ = self.events.send(ev.clone());
        }
    }

    /// Create a primary entry at `address`; composite formats also create their
    /// continuation words at the following addresses.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate name, an address collision, a composite running
    /// past 65535, or an initial value that does not parse.
    pub fn define(
        &self,
        table: PrimaryTable,
        address: u16,
        def: EntryDefinition,
    ) -> Result<(), ModbusError> {
        let format = if table.is_bit_table() {
            if def.format != DisplayFormat::Bool {
                log::debug!(
                    "{table} entry '{}' forced from {} to Bool",
                    def.name,
                    def.format
                );
            }
            DisplayFormat::Bool
        } else {
            def.format
        };
        if def.name.trim().is_empty() {
            return Err(ModbusError::Protocol(format!(
                "{table} entry at {address} has no name"
            )));
        }
        let words = format.words();
        let last = u32::from(address) + words as u32 - 1;
        if last > u32::from(u16::MAX) {
            return Err(ModbusError::Protocol(format!(
                "{format} entry '{}' at {address} runs past address 65535",
                def.name
            )));
        }
        let values = if def.value.trim().is_empty() {
            vec![0u16; words]
        } else {
            format.parse_words(&def.value)?
        };

        let mut guard = self.write();
        let t = guard.get_mut(table);
        if t.names.contains_key(&def.name) {
            return Err(ModbusError::DuplicateEntry(def.name));
        }
        for a in u32::from(address)..=last {
            if t.entries.contains_key(&(a as u16)) {
                return Err(ModbusError::DuplicateEntry(format!(
                    "{table} address {a} already defined"
                )));
            }
        }
        let mut head = RegisterEntry::new(
            address,
            RegisterItem::primary(def.name.clone(), def.comment, format),
        );
        head.set_raw(values[0]);
        t.entries.insert(address, head);
        for (i, w) in values.iter().enumerate().skip(1) {
            let a = address + i as u16;
            let mut cont = RegisterEntry::continuation(a, address);
            cont.set_raw(*w);
            t.entries.insert(a, cont);
        }
        t.names.insert(def.name, (address, 0));
        Ok(())
    }

    /// Carve a named sub-field out of the word at `primary_address`.
    ///
    /// # Errors
    ///
    /// Fails for bit tables, composite entries, split or overlapping masks,
    /// duplicate names and unknown addresses.
    pub fn add_item(
        &self,
        table: PrimaryTable,
        primary_address: u16,
        mask: u16,
        name: &str,
        format: DisplayFormat,
    ) -> Result<usize, ModbusError> {
        if table.is_bit_table() {
            return Err(ModbusError::Protocol(format!(
                "{table} entries are single bits, cannot add item '{name}'"
            )));
        }
        if name.trim().is_empty() {
            return Err(ModbusError::Protocol("item name empty".into()));
        }
        let mut guard = self.write();
        let t = guard.get_mut(table);
        if t.names.contains_key(name) {
            return Err(ModbusError::DuplicateEntry(name.to_string()));
        }
        let entry = t.entries.get_mut(&primary_address).ok_or_else(|| {
            ModbusError::UnknownEntry(format!("{table} address {primary_address}"))
        })?;
        let idx = entry.add_item(mask, name, format)?;
        t.names.insert(name.to_string(), (primary_address, idx));
        Ok(idx)
    }

    #[must_use]
    pub fn exists_address(&self, table: PrimaryTable, address: u16) -> bool {
        self.read().get(table).entries.contains_key(&address)
    }

    #[must_use]
    pub fn exists_name(&self, table: PrimaryTable, name: &str) -> bool {
        self.read().get(table).names.contains_key(name)
    }

    /// `false` iff at least one address of `[address, address + count - 1]` is
    /// missing (an empty span or one running past 65535 is never available).
    #[must_use]
    pub fn is_range_available(&self, table: PrimaryTable, address: u16, count: u16) -> bool {
        let guard = self.read();
        range_available(guard.get(table), address, count)
    }

    /// Item names in address order. Composite values are listed only when
    /// `include_composite` is set; continuation words have no name.
    #[must_use]
    pub fn names_in_table(&self, table: PrimaryTable, include_composite: bool) -> Vec<String> {
        let guard = self.read();
        let mut out = Vec::new();
        for entry in guard.get(table).entries.values() {
            if entry.is_continuation() {
                continue;
            }
            for (i, item) in entry.items.iter().enumerate() {
                if i == 0 && !include_composite && entry.is_composite_head() {
                    continue;
                }
                out.push(item.name.clone());
            }
        }
        out
    }

    /// Snapshot of one entry.
    #[must_use]
    pub fn entry(&self, table: PrimaryTable, address: u16) -> Option<RegisterEntry> {
        self.read().get(table).entries.get(&address).cloned()
    }

    /// Snapshot of a whole table in address order.
    #[must_use]
    pub fn entries(&self, table: PrimaryTable) -> Vec<RegisterEntry> {
        self.read().get(table).entries.values().cloned().collect()
    }

    /// Resolve a name to its primary entry and item index.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::UnknownEntry` when the name is not in `table`.
    pub fn resolve(&self, table: PrimaryTable, name: &str) -> Result<Location, ModbusError> {
        let guard = self.read();
        resolve_in(guard.get(table), table, name)
    }

    /// Formatted value of a named item.
    ///
    /// # Errors
    ///
    /// Fails for unknown names, or when the stored bits are not valid in the
    /// item's format (a BCD nibble above 9).
    pub fn get(&self, table: PrimaryTable, name: &str) -> Result<String, ModbusError> {
        let guard = self.read();
        let t = guard.get(table);
        let loc = resolve_in(t, table, name)?;
        format_item(t, table, loc.address, loc.item)
    }

    /// Formatted value of item `item` of the entry at `address`.
    ///
    /// # Errors
    ///
    /// Fails for unknown addresses or item indices, or unformattable values.
    pub fn get_at(&self, table: PrimaryTable, address: u16, item: usize) -> Result<String, ModbusError> {
        let guard = self.read();
        format_item(guard.get(table), table, address, item)
    }

    /// Parse `text` in the item's format and store it. Returns the names of
    /// every item whose value changed; the store is untouched on error.
    ///
    /// # Errors
    ///
    /// Fails for unknown names and for text that does not parse.
    pub fn set(&self, table: PrimaryTable, name: &str, text: &str) -> Result<Vec<String>, ModbusError> {
        let changes = {
            let mut guard = self.write();
            let t = guard.get_mut(table);
            let loc = resolve_in(t, table, name)?;
            set_item(t, table, loc.address, loc.item, text)?
        };
        self.emit(&changes.events);
        Ok(changes.items)
    }

    /// Address based form of [`Self::set`].
    ///
    /// # Errors
    ///
    /// Fails for unknown addresses or items and for text that does not parse.
    pub fn set_at(
        &self,
        table: PrimaryTable,
        address: u16,
        item: usize,
        text: &str,
    ) -> Result<Vec<String>, ModbusError> {
        let changes = {
            let mut guard = self.write();
            set_item(guard.get_mut(table), table, address, item, text)?
        };
        self.emit(&changes.events);
        Ok(changes.items)
    }

    /// Raw register values of `[address, address + count)`.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Exception(IllegalDataAddress)` when any address
    /// in the span is unmapped.
    pub fn read_words(&self, table: PrimaryTable, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        let guard = self.read();
        let t = guard.get(table);
        if !range_available(t, address, count) {
            return Err(ModbusError::Exception(ExceptionCode::IllegalDataAddress));
        }
        Ok(t.entries
            .range(address..=address + (count - 1))
            .map(|(_, e)| e.value)
            .collect())
    }

    /// Store raw values starting at `address` in a single lock acquisition.
    /// Returns (and broadcasts) the change events.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Exception(IllegalDataAddress)` without writing
    /// anything when any target address is unmapped.
    pub fn write_words(
        &self,
        table: PrimaryTable,
        address: u16,
        values: &[u16],
    ) -> Result<Vec<ChangeEvent>, ModbusError> {
        let changes = {
            let mut guard = self.write();
            store_words(guard.get_mut(table), table, address, values)?
        };
        self.emit(&changes.events);
        Ok(changes.events)
    }

    /// Bit view of [`Self::read_words`] for coils and discrete inputs.
    ///
    /// # Errors
    ///
    /// As [`Self::read_words`].
    pub fn read_bits(&self, table: PrimaryTable, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        Ok(self
            .read_words(table, address, count)?
            .into_iter()
            .map(|w| w != 0)
            .collect())
    }

    /// Bit view of [`Self::write_words`].
    ///
    /// # Errors
    ///
    /// As [`Self::write_words`].
    pub fn write_bits(
        &self,
        table: PrimaryTable,
        address: u16,
        values: &[bool],
    ) -> Result<Vec<ChangeEvent>, ModbusError> {
        let words: Vec<u16> = values.iter().map(|&b| u16::from(b)).collect();
        self.write_words(table, address, &words)
    }
}

impl RegisterAccess for RegisterStore {
    fn value(&self, table: PrimaryTable, name: &str) -> Result<String, ModbusError> {
        self.get(table, name)
    }

    fn set_value(&self, table: PrimaryTable, name: &str, text: &str) -> Result<(), ModbusError> {
        self.set(table, name, text).map(|_| ())
    }
}

fn range_available(t: &RegisterTable, address: u16, count: u16) -> bool {
    if count == 0 {
        return false;
    }
    let last = u32::from(address) + u32::from(count) - 1;
    if last > u32::from(u16::MAX) {
        return false;
    }
    // BTreeMap keys are unique, so a full span holds exactly `count` keys
    t.entries.range(address..=last as u16).count() == usize::from(count)
}

fn resolve_in(t: &RegisterTable, table: PrimaryTable, name: &str) -> Result<Location, ModbusError> {
    let (address, item) = *t
        .names
        .get(name)
        .ok_or_else(|| ModbusError::UnknownEntry(format!("{table}:{name}")))?;
    let entry = t
        .entries
        .get(&address)
        .ok_or_else(|| ModbusError::UnknownEntry(format!("{table}:{name}")))?;
    let it = &entry.items[item];
    Ok(Location {
        table,
        address,
        item,
        mask: it.mask,
        format: it.format,
        words: if item == 0 { it.format.words() } else { 1 },
    })
}

fn item_of(t: &RegisterTable, table: PrimaryTable, address: u16, item: usize) -> Result<(&RegisterEntry, &RegisterItem), ModbusError> {
    let entry = t
        .entries
        .get(&address)
        .ok_or_else(|| ModbusError::UnknownEntry(format!("{table} address {address}")))?;
    let it = entry.items.get(item).ok_or_else(|| {
        ModbusError::UnknownEntry(format!("{table} address {address} item {item}"))
    })?;
    Ok((entry, it))
}

fn format_item(t: &RegisterTable, table: PrimaryTable, address: u16, item: usize) -> Result<String, ModbusError> {
    let (entry, it) = item_of(t, table, address, item)?;
    if item > 0 {
        return it.format.format_words(&[it.value]);
    }
    let n = it.format.words();
    if n == 1 || entry.is_continuation() {
        return it.format.format_words(&[entry.value]);
    }
    let words: Vec<u16> = t
        .entries
        .range(address..)
        .take(n)
        .map(|(_, e)| e.value)
        .collect();
    it.format.format_words(&words)
}

fn set_item(
    t: &mut RegisterTable,
    table: PrimaryTable,
    address: u16,
    item: usize,
    text: &str,
) -> Result<Changes, ModbusError> {
    let (entry, it) = item_of(t, table, address, item)?;
    let words = if item == 0 {
        it.format.parse_words(text)?
    } else {
        let field = it.format.parse_words(text)?[0];
        if !it.fits(field) {
            return Err(ModbusError::invalid_value(
                text,
                format!("does not fit mask 0x{:04X}", it.mask),
            ));
        }
        vec![it.merge(entry.value, field)]
    };
    store_words(t, table, address, &words)
}

fn store_words(
    t: &mut RegisterTable,
    table: PrimaryTable,
    address: u16,
    values: &[u16],
) -> Result<Changes, ModbusError> {
    let count = u16::try_from(values.len())
        .map_err(|_| ModbusError::Exception(ExceptionCode::IllegalDataValue))?;
    if !range_available(t, address, count) {
        return Err(ModbusError::Exception(ExceptionCode::IllegalDataAddress));
    }
    let bits = table.is_bit_table();
    let mut changes = Changes::default();
    let mut heads: Vec<u16> = Vec::new();
    for (i, &raw) in values.iter().enumerate() {
        let a = address + i as u16;
        let raw = if bits { u16::from(raw != 0) } else { raw };
        let Some(entry) = t.entries.get_mut(&a) else {
            continue;
        };
        let changed = entry.set_raw(raw);
        if changed.is_empty() {
            continue;
        }
        if let Some(head) = entry.head {
            if !heads.contains(&head) {
                heads.push(head);
            }
            continue;
        }
        for idx in changed {
            changes.push_item(&entry.items[idx].name);
        }
        changes.push_event(table, &entry.items[0].name);
    }
    for head in heads {
        if let Some(entry) = t.entries.get(&head) {
            let name = entry.items[0].name.clone();
            changes.push_item(&name);
            changes.push_event(table, &name);
        }
    }
    if !changes.events.is_empty() {
        log::debug!(
            "{table} write at {address} x{count}: changed {:?}",
            changes.items
        );
    }
    Ok(changes)
}
