use crate::error::ModbusError;
use crate::value_format::DisplayFormat;

/// Mask of a primary item / composite head.
pub const FULL_MASK: u16 = 0xFFFF;
/// Mask carried by the continuation words of a composite value.
pub const CONTINUATION_MASK: u16 = 0x0000;

/// Validate that `mask` is one contiguous run of set bits and return the
/// position of its lowest set bit.
///
/// # Errors
///
/// Returns `ModbusError::InvalidMask` for an empty or split mask.
pub fn mask_offset(mask: u16) -> Result<u8, ModbusError> {
    if mask == 0 {
        return Err(ModbusError::InvalidMask(mask));
    }
    let offset = mask.trailing_zeros();
    let run = u32::from(mask >> offset);
    // a contiguous run shifted down is 2^k - 1
    if run & (run + 1) != 0 {
        return Err(ModbusError::InvalidMask(mask));
    }
    Ok(offset as u8)
}

/// A named view on (part of) a register word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterItem {
    pub name: String,
    pub comment: String,
    pub mask: u16,
    pub offset: u8,
    pub format: DisplayFormat,
    /// Field value, already shifted down by `offset`.
    pub value: u16,
}

impl RegisterItem {
    #[must_use]
    pub fn primary(name: impl Into<String>, comment: impl Into<String>, format: DisplayFormat) -> Self {
        Self {
            name: name.into(),
            comment: comment.into(),
            mask: FULL_MASK,
            offset: 0,
            format,
            value: 0,
        }
    }

    #[must_use]
    pub const fn extract(&self, raw: u16) -> u16 {
        (raw & self.mask) >> self.offset
    }

    /// Clear the item's bits in `raw` and OR in `field`.
    #[must_use]
    pub const fn merge(&self, raw: u16, field: u16) -> u16 {
        (raw & !self.mask) | ((field << self.offset) & self.mask)
    }

    /// `true` when `field` fits into the bits covered by the mask.
    #[must_use]
    pub fn fits(&self, field: u16) -> bool {
        (u32::from(field) << self.offset) & !u32::from(self.mask) == 0
    }
}

/// One 16-bit (or 1-bit) register and the items carved out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterEntry {
    pub address: u16,
    pub value: u16,
    /// Item 0 is the primary value, further items are masked sub-fields.
    pub items: Vec<RegisterItem>,
    /// For a composite continuation word: address of the composite head.
    pub head: Option<u16>,
}

impl RegisterEntry {
    #[must_use]
    pub fn new(address: u16, primary: RegisterItem) -> Self {
        Self {
            address,
            value: 0,
            items: vec![primary],
            head: None,
        }
    }

    /// Unnamed follow-up word of the composite starting at `head`.
    #[must_use]
    pub fn continuation(address: u16, head: u16) -> Self {
        Self {
            address,
            value: 0,
            items: vec![RegisterItem {
                name: String::new(),
                comment: String::new(),
                mask: CONTINUATION_MASK,
                offset: 0,
                format: DisplayFormat::Hex,
                value: 0,
            }],
            head: Some(head),
        }
    }

    #[must_use]
    pub fn primary(&self) -> &RegisterItem {
        &self.items[0]
    }

    #[must_use]
    pub const fn is_continuation(&self) -> bool {
        self.head.is_some()
    }

    #[must_use]
    pub fn is_composite_head(&self) -> bool {
        self.head.is_none() && self.primary().format.is_composite()
    }

    /// Store a new raw value and recompute every item. Returns the indices of
    /// the items whose value changed.
    pub(crate) fn set_raw(&mut self, raw: u16) -> Vec<usize> {
        self.value = raw;
        let mut changed = Vec::new();
        for (i, item) in self.items.iter_mut().enumerate() {
            let v = if item.mask == CONTINUATION_MASK {
                raw
            } else {
                item.extract(raw)
            };
            if item.value != v {
                item.value = v;
                changed.push(i);
            }
        }
        changed
    }

    /// Append a secondary item. Fails when the mask is split or overlaps a
    /// sibling, or the entry cannot carry sub-fields.
    pub(crate) fn add_item(
        &mut self,
        mask: u16,
        name: &str,
        format: DisplayFormat,
    ) -> Result<usize, ModbusError> {
        if self.is_continuation() || self.primary().format.is_composite() {
            return Err(ModbusError::Protocol(format!(
                "cannot add item '{name}' to composite register {}",
                self.address
            )));
        }
        if format.is_composite() {
            return Err(ModbusError::Protocol(format!(
                "secondary item '{name}' cannot use composite format {format}"
            )));
        }
        let offset = mask_offset(mask)?;
        if mask == FULL_MASK || self.items.iter().skip(1).any(|it| it.mask & mask != 0) {
            return Err(ModbusError::InvalidMask(mask));
        }
        let mut item = RegisterItem {
            name: name.to_string(),
            comment: String::new(),
            mask,
            offset,
            format,
            value: 0,
        };
        item.value = item.extract(self.value);
        self.items.push(item);
        Ok(self.items.len() - 1)
    }
}
