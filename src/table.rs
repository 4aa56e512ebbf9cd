use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ModbusError;

/// One of the four Modbus data tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum PrimaryTable {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

/// Highest classic register number accepted for holding registers
/// (`40001 + 65535`).
pub const HOLDING_REGISTER_NUMBER_MAX: u32 = 105_536;

impl PrimaryTable {
    pub const ALL: [Self; 4] = [
        Self::Coil,
        Self::DiscreteInput,
        Self::InputRegister,
        Self::HoldingRegister,
    ];

    /// `true` for the 1-bit tables.
    #[must_use]
    pub const fn is_bit_table(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    /// `true` when a Modbus client may write into this table.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Coil => 0,
            Self::DiscreteInput => 1,
            Self::InputRegister => 2,
            Self::HoldingRegister => 3,
        }
    }

    /// Base of the classic 5-digit register numbering (`0xxxx`, `1xxxx`, `3xxxx`, `4xxxx`).
    #[must_use]
    pub const fn number_base(self) -> u32 {
        match self {
            Self::Coil => 1,
            Self::DiscreteInput => 10_001,
            Self::InputRegister => 30_001,
            Self::HoldingRegister => 40_001,
        }
    }

    /// Classic register number for a zero-based address in this table.
    #[must_use]
    pub fn register_number(self, address: u16) -> u32 {
        self.number_base() + u32::from(address)
    }

    /// Split a classic register number into its table and zero-based address.
    ///
    /// `40206` is holding register address 205. Holding registers accept the
    /// extended range up to 105536 so that every 16-bit address is reachable.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::Protocol` for numbers outside every table range.
    pub fn from_register_number(number: u32) -> Result<(Self, u16), ModbusError> {
        let table = match number {
            1..=9_999 => Self::Coil,
            10_001..=19_999 => Self::DiscreteInput,
            30_001..=39_999 => Self::InputRegister,
            40_001..=HOLDING_REGISTER_NUMBER_MAX => Self::HoldingRegister,
            _ => {
                return Err(ModbusError::Protocol(format!(
                    "register number out of range: {number}"
                )))
            }
        };
        let address = u16::try_from(number - table.number_base()).map_err(|_| {
            ModbusError::Protocol(format!("register number out of range: {number}"))
        })?;
        Ok((table, address))
    }
}

impl fmt::Display for PrimaryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coil => "Coil",
            Self::DiscreteInput => "DiscreteInput",
            Self::InputRegister => "InputRegister",
            Self::HoldingRegister => "HoldingRegister",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PrimaryTable {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coil" | "co" => Ok(Self::Coil),
            "discreteinput" | "di" => Ok(Self::DiscreteInput),
            "inputregister" | "ir" => Ok(Self::InputRegister),
            "holdingregister" | "hr" => Ok(Self::HoldingRegister),
            other => Err(ModbusError::Protocol(format!("unknown table: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_number_holding() {
        let (t, a) = PrimaryTable::from_register_number(40206).expect("40206");
        assert_eq!(t, PrimaryTable::HoldingRegister);
        assert_eq!(a, 205);
        assert_eq!(t.register_number(a), 40206);
    }

    #[test]
    fn test_register_number_extended_holding() {
        let (t, a) = PrimaryTable::from_register_number(105_536).expect("max");
        assert_eq!(t, PrimaryTable::HoldingRegister);
        assert_eq!(a, 65535);
        assert!(PrimaryTable::from_register_number(105_537).is_err());
    }

    #[test]
    fn test_register_number_bit_tables() {
        assert_eq!(
            PrimaryTable::from_register_number(1).expect("coil"),
            (PrimaryTable::Coil, 0)
        );
        assert_eq!(
            PrimaryTable::from_register_number(10_010).expect("di"),
            (PrimaryTable::DiscreteInput, 9)
        );
        assert_eq!(
            PrimaryTable::from_register_number(30_001).expect("ir"),
            (PrimaryTable::InputRegister, 0)
        );
    }

    #[test]
    fn test_register_number_gaps_rejected() {
        assert!(PrimaryTable::from_register_number(0).is_err());
        assert!(PrimaryTable::from_register_number(10_000).is_err());
        assert!(PrimaryTable::from_register_number(25_000).is_err());
    }
}
