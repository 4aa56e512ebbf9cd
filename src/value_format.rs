//! Display formats and the conversions between register words and text.
//!
//! Composite values are stored low word first, the word order a
//! little-endian host produces when a 32-bit value is viewed as two `u16`s.
//! Strings pack two characters per word, high byte first.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum DisplayFormat {
    Hex,
    Bool,
    Int,
    Uint,
    Ascii,
    Bcd,
    Float,
    Long,
    Str8,
    Str16,
}

impl DisplayFormat {
    /// Number of consecutive 16-bit registers a value of this format occupies.
    #[must_use]
    pub const fn words(self) -> usize {
        match self {
            Self::Hex | Self::Bool | Self::Int | Self::Uint | Self::Ascii | Self::Bcd => 1,
            Self::Float | Self::Long => 2,
            Self::Str8 => 4,
            Self::Str16 => 8,
        }
    }

    #[must_use]
    pub const fn is_composite(self) -> bool {
        self.words() > 1
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hex => "Hex",
            Self::Bool => "Bool",
            Self::Int => "Int",
            Self::Uint => "Uint",
            Self::Ascii => "Ascii",
            Self::Bcd => "Bcd",
            Self::Float => "Float",
            Self::Long => "Long",
            Self::Str8 => "Str8",
            Self::Str16 => "Str16",
        }
    }

    /// Render `words` (at least [`Self::words`] of them) as text.
    ///
    /// # Errors
    ///
    /// Fails when too few words are supplied or, for `Bcd`, when a nibble is
    /// above 9.
    pub fn format_words(self, words: &[u16]) -> Result<String, ModbusError> {
        if words.len() < self.words() {
            return Err(ModbusError::Protocol(format!(
                "{self} needs {} words, got {}",
                self.words(),
                words.len()
            )));
        }
        let w = words[0];
        let text = match self {
            Self::Hex => format!("{w:04X}"),
            Self::Bool => String::from(if w != 0 { "1" } else { "0" }),
            Self::Int => i16::from_le_bytes(w.to_le_bytes()).to_string(),
            Self::Uint => w.to_string(),
            Self::Ascii => bytes_to_text(&w.to_be_bytes(), false),
            Self::Bcd => {
                let mut out = String::with_capacity(4);
                for shift in [12u16, 8, 4, 0] {
                    let nibble = (w >> shift) & 0x0F;
                    if nibble > 9 {
                        return Err(ModbusError::invalid_value(
                            &format!("{w:04X}"),
                            "not a BCD value (nibble above 9)",
                        ));
                    }
                    out.push(char::from(b'0' + nibble as u8));
                }
                out
            }
            Self::Float => format_float(join_u32(words)),
            Self::Long => i32::from_le_bytes(join_u32(words).to_le_bytes()).to_string(),
            Self::Str8 | Self::Str16 => {
                let bytes: Vec<u8> = words[..self.words()]
                    .iter()
                    .flat_map(|w| w.to_be_bytes())
                    .collect();
                bytes_to_text(&bytes, true)
            }
        };
        Ok(text)
    }

    /// Parse `text` into exactly [`Self::words`] register words.
    ///
    /// Nothing is partially produced: any malformed input yields an error.
    ///
    /// # Errors
    ///
    /// Returns `ModbusError::InvalidValue` describing why the text was rejected.
    pub fn parse_words(self, text: &str) -> Result<Vec<u16>, ModbusError> {
        let t = text.trim();
        let words = match self {
            Self::Hex => {
                let digits = t
                    .strip_prefix("0x")
                    .or_else(|| t.strip_prefix("0X"))
                    .unwrap_or(t);
                if digits.is_empty() || digits.len() > 4 {
                    return Err(ModbusError::invalid_value(text, "expected 1 to 4 hex digits"));
                }
                let v = u16::from_str_radix(digits, 16)
                    .map_err(|e| ModbusError::invalid_value(text, e.to_string()))?;
                vec![v]
            }
            Self::Bool => match t.to_ascii_lowercase().as_str() {
                "0" | "false" => vec![0],
                "1" | "true" => vec![1],
                _ => return Err(ModbusError::invalid_value(text, "expected 0 or 1")),
            },
            Self::Int => {
                let v: i16 = t
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ModbusError::invalid_value(text, e.to_string()))?;
                vec![u16::from_le_bytes(v.to_le_bytes())]
            }
            Self::Uint => {
                let v: u16 = t
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ModbusError::invalid_value(text, e.to_string()))?;
                vec![v]
            }
            Self::Ascii => {
                // not trimmed: spaces are valid characters here
                let bytes = text_to_bytes(text, 2)?;
                vec![u16::from_be_bytes([bytes[0], bytes[1]])]
            }
            Self::Bcd => {
                if t.is_empty() || t.len() > 4 || !t.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ModbusError::invalid_value(text, "expected 1 to 4 decimal digits"));
                }
                let v = t
                    .bytes()
                    .fold(0u16, |acc, b| (acc << 4) | u16::from(b - b'0'));
                vec![v]
            }
            Self::Float => split_u32(parse_float(text, t)?).to_vec(),
            Self::Long => {
                let v: i32 = t
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ModbusError::invalid_value(text, e.to_string()))?;
                split_u32(u32::from_le_bytes(v.to_le_bytes())).to_vec()
            }
            Self::Str8 | Self::Str16 => {
                let bytes = text_to_bytes(text, self.words() * 2)?;
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect()
            }
        };
        Ok(words)
    }
}

impl fmt::Display for DisplayFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DisplayFormat {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hex" => Ok(Self::Hex),
            "bool" => Ok(Self::Bool),
            "int" => Ok(Self::Int),
            "uint" => Ok(Self::Uint),
            "ascii" => Ok(Self::Ascii),
            "bcd" => Ok(Self::Bcd),
            "float" => Ok(Self::Float),
            "long" => Ok(Self::Long),
            "str8" => Ok(Self::Str8),
            "str16" => Ok(Self::Str16),
            other => Err(ModbusError::Protocol(format!(
                "unknown display format: {other}"
            ))),
        }
    }
}

fn join_u32(words: &[u16]) -> u32 {
    let low = u32::from(words[0]);
    let high = u32::from(words[1]);
    (high << 16) | low
}

fn split_u32(v: u32) -> [u16; 2] {
    let low = (v & 0xFFFF) as u16;
    let high = ((v >> 16) & 0xFFFF) as u16;
    [low, high]
}

// A NaN other than the canonical one keeps its bit pattern in the text.
fn format_float(bits: u32) -> String {
    let v = f32::from_bits(bits);
    if v.is_nan() && bits != f32::NAN.to_bits() {
        return format!("NaN(0x{bits:08X})");
    }
    v.to_string()
}

fn parse_float(text: &str, t: &str) -> Result<u32, ModbusError> {
    if let Some(hex) = t.strip_prefix("NaN(0x").and_then(|r| r.strip_suffix(')')) {
        let bits = u32::from_str_radix(hex, 16)
            .map_err(|e| ModbusError::invalid_value(text, e.to_string()))?;
        if !f32::from_bits(bits).is_nan() {
            return Err(ModbusError::invalid_value(text, "bit pattern is not a NaN"));
        }
        return Ok(bits);
    }
    let v: f32 = t
        .parse()
        .map_err(|e: std::num::ParseFloatError| ModbusError::invalid_value(text, e.to_string()))?;
    Ok(v.to_bits())
}

// Bytes map 1:1 onto U+0000..U+00FF so every register value has a text form.
fn bytes_to_text(bytes: &[u8], trim_nul: bool) -> String {
    let mut s: String = bytes.iter().map(|&b| char::from(b)).collect();
    if trim_nul {
        let trimmed = s.trim_end_matches('\0').len();
        s.truncate(trimmed);
    }
    s
}

fn text_to_bytes(text: &str, capacity: usize) -> Result<Vec<u8>, ModbusError> {
    let mut out = Vec::with_capacity(capacity);
    for ch in text.chars() {
        let b = u8::try_from(u32::from(ch))
            .map_err(|_| ModbusError::invalid_value(text, format!("character '{ch}' does not fit one byte")))?;
        out.push(b);
    }
    if out.len() > capacity {
        return Err(ModbusError::invalid_value(
            text,
            format!("at most {capacity} characters allowed"),
        ));
    }
    out.resize(capacity, 0);
    Ok(out)
}
