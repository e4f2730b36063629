use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::types::{Area, MAX_WIRE_ADDRESS};
use crate::errors::{Error, Result};

/// Largest byte offset whose bit address still fits the 3-byte wire field
const MAX_BYTE_OFFSET: u32 = MAX_WIRE_ADDRESS / 8;

/// Parsed form of a textual PLC address such as `M100`, `DB20.100.3` or `T5`.
///
/// `start` is a bit address (`byte * 8 + bit`) for every area except counters
/// and timers, where it is the index of a 16 bit word. `length` is counted in
/// the native unit of the area: bytes, or words for counters and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressSpec {
    /// Memory area
    pub area: Area,
    /// Data block number, 0 unless `area` is a data block
    pub db_number: u16,
    /// Bit address, or word index for counters and timers
    pub start: u32,
    /// Number of elements to transfer
    pub length: u16,
}

impl AddressSpec {
    /// Parse a textual address.
    ///
    /// Supported forms are `I`, `Q`, `M`, `AI`, `AQ` and `V` followed by a byte
    /// offset and an optional `.bit`, `DB<block>.<byte>[.<bit>]` (also in the
    /// `DB<block>.DBX/DBB/DBW/DBD<byte>` notation), and `T<n>` / `C<n>`.
    /// `V<n>` is the same address as `DB1.<n>`.
    /// # Errors
    ///
    /// Will return `Error::AddressFormat` if the text does not follow the grammar.
    pub fn parse(text: &str, length: u16) -> Result<Self> {
        let normalized = text.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(Error::address(text, "empty address"));
        }
        if !normalized.is_ascii() {
            return Err(Error::address(text, "unexpected characters"));
        }

        let (area, db_number, rest) = if let Some(rest) = normalized.strip_prefix("AI") {
            (Area::AnalogIn, 0, rest)
        } else if let Some(rest) = normalized.strip_prefix("AQ") {
            (Area::AnalogOut, 0, rest)
        } else if let Some(rest) = normalized.strip_prefix("DB") {
            let (block, offset) = parse_db_block(text, rest)?;
            (Area::DataBlock, block, offset)
        } else {
            let (prefix, rest) = normalized.split_at(1);
            let (area, db_number) = match prefix {
                "I" => (Area::Input, 0),
                "Q" => (Area::Output, 0),
                "M" => (Area::Memory, 0),
                "V" => (Area::DataBlock, 1),
                "T" => (Area::Timer, 0),
                "C" => (Area::Counter, 0),
                _ => return Err(Error::address(text, "unknown area prefix")),
            };
            (area, db_number, rest)
        };

        let start = if area.is_word_area() {
            parse_word_index(text, rest)?
        } else {
            parse_bit_address(text, rest)?
        };

        Ok(Self {
            area,
            db_number,
            start,
            length,
        })
    }

    /// Byte offset of the first addressed byte inside its area
    pub fn byte_offset(&self) -> u32 {
        if self.area.is_word_area() {
            self.start * 2
        } else {
            self.start / 8
        }
    }

    /// Bit index inside the first addressed byte
    pub fn bit_index(&self) -> u8 {
        if self.area.is_word_area() {
            0
        } else {
            (self.start % 8) as u8
        }
    }

    /// Number of bytes that `length` elements occupy
    pub fn byte_len(&self) -> usize {
        if self.area.is_word_area() {
            usize::from(self.length) * 2
        } else {
            usize::from(self.length)
        }
    }

    /// Copy of this address pointing at the whole byte that contains the addressed bit
    pub fn covering_byte(&self) -> Self {
        Self {
            start: self.start - u32::from(self.bit_index()),
            length: 1,
            ..*self
        }
    }

    /// Set `length` from a byte count
    pub(crate) fn set_byte_len(&mut self, bytes: usize) -> Result<()> {
        let units = if self.area.is_word_area() {
            if bytes % 2 != 0 {
                return Err(Error::InvalidLength(format!(
                    "counters and timers are transferred in words, {bytes} bytes requested"
                )));
            }
            bytes / 2
        } else {
            bytes
        };
        self.length = u16::try_from(units)
            .map_err(|_| Error::InvalidLength(format!("{bytes} bytes exceed a single transfer")))?;
        Ok(())
    }

    /// Move the cursor behind `sent` bytes of a split transfer
    pub(crate) fn advance(&mut self, sent: usize) {
        let sent = sent as u32;
        if self.area.is_word_area() {
            self.start += sent / 2;
        } else {
            self.start += sent * 8;
        }
    }

    /// Validate that the current cursor is encodable in a request item
    pub(crate) fn check_wire_address(&self) -> Result<()> {
        if self.start > MAX_WIRE_ADDRESS {
            return Err(Error::address(
                &self.to_string(),
                "address exceeds the 3-byte address field",
            ));
        }
        Ok(())
    }
}

impl FromStr for AddressSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, 1)
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.area {
            Area::Timer => return write!(f, "T{}", self.start),
            Area::Counter => return write!(f, "C{}", self.start),
            Area::DataBlock => format!("DB{}.", self.db_number),
            Area::Input => "I".to_string(),
            Area::Output => "Q".to_string(),
            Area::Memory => "M".to_string(),
            Area::AnalogIn => "AI".to_string(),
            Area::AnalogOut => "AQ".to_string(),
        };
        write!(f, "{prefix}{}", self.byte_offset())?;
        match self.bit_index() {
            0 => Ok(()),
            bit => write!(f, ".{bit}"),
        }
    }
}

fn parse_db_block<'a>(text: &str, rest: &'a str) -> Result<(u16, &'a str)> {
    let (block, offset) = rest
        .split_once('.')
        .ok_or_else(|| Error::address(text, "data block address needs a block number and an offset"))?;
    if block.is_empty() {
        return Err(Error::address(text, "missing data block number"));
    }
    let block = parse_number(text, block, "data block number")?;
    let block = u16::try_from(block).map_err(|_| Error::address(text, "data block number too large"))?;

    // STEP7 operand notation: DB1.DBX0.1, DB1.DBB0, DB1.DBW0, DB1.DBD0
    if let Some(offset) = offset.strip_prefix("DBX") {
        return Ok((block, offset));
    }
    match ["DBB", "DBW", "DBD"]
        .iter()
        .find_map(|operand| offset.strip_prefix(operand))
    {
        Some(whole_bytes) if whole_bytes.contains('.') => Err(Error::address(
            text,
            "only DBX operands take a bit index",
        )),
        Some(whole_bytes) => Ok((block, whole_bytes)),
        None => Ok((block, offset)),
    }
}

fn parse_bit_address(text: &str, rest: &str) -> Result<u32> {
    let mut parts = rest.split('.');
    let byte = parse_number(text, parts.next().unwrap_or_default(), "byte offset")?;
    let bit = match parts.next() {
        Some(bit) => parse_number(text, bit, "bit index")?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(Error::address(text, "too many address components"));
    }
    if bit > 7 {
        return Err(Error::address(text, "bit index must be within 0..7"));
    }
    if byte > MAX_BYTE_OFFSET {
        return Err(Error::address(text, "byte offset out of range"));
    }
    Ok(byte * 8 + bit)
}

fn parse_word_index(text: &str, rest: &str) -> Result<u32> {
    if rest.contains('.') {
        return Err(Error::address(text, "counters and timers have no bit access"));
    }
    let index = parse_number(text, rest, "index")?;
    if index > u32::from(u16::MAX) {
        return Err(Error::address(text, "index out of range"));
    }
    Ok(index)
}

fn parse_number(text: &str, digits: &str, what: &str) -> Result<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::address(text, format!("invalid {what} '{digits}'")));
    }
    digits
        .parse::<u32>()
        .map_err(|_| Error::address(text, format!("{what} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_byte_and_bit_areas() {
        let m = AddressSpec::parse("M100", 2).unwrap();
        assert_eq!(
            m,
            AddressSpec {
                area: Area::Memory,
                db_number: 0,
                start: 800,
                length: 2
            }
        );

        let input = AddressSpec::parse("I100.2", 1).unwrap();
        assert_eq!(input.area, Area::Input);
        assert_eq!(input.start, 802);
        assert_eq!(input.byte_offset(), 100);
        assert_eq!(input.bit_index(), 2);

        let output = AddressSpec::parse("q3", 1).unwrap();
        assert_eq!(output.area, Area::Output);
        assert_eq!(output.start, 24);

        let ai = AddressSpec::parse("AI100", 2).unwrap();
        assert_eq!(ai.area, Area::AnalogIn);
        assert_eq!(ai.start, 800);
        assert_eq!(AddressSpec::parse("AQ4", 2).unwrap().area, Area::AnalogOut);
    }

    #[test]
    fn parse_data_blocks() {
        let db = AddressSpec::parse("DB20.100", 4).unwrap();
        assert_eq!(db.area, Area::DataBlock);
        assert_eq!(db.db_number, 20);
        assert_eq!(db.start, 800);

        let bit = AddressSpec::parse("DB20.100.3", 1).unwrap();
        assert_eq!(bit.start, 803);

        assert_eq!(AddressSpec::parse("DB20.DBX100.3", 1).unwrap(), bit);
        assert_eq!(AddressSpec::parse("DB20.DBW100", 4).unwrap(), db);
        assert_eq!(AddressSpec::parse(" db20.dbd100 ", 4).unwrap(), db);
    }

    #[test]
    fn v_is_an_alias_for_db1() {
        for offset in ["0", "100", "100.7", "4095"] {
            assert_eq!(
                AddressSpec::parse(&format!("V{offset}"), 3).unwrap(),
                AddressSpec::parse(&format!("DB1.{offset}"), 3).unwrap()
            );
        }
    }

    #[test]
    fn parse_counters_and_timers() {
        let timer = AddressSpec::parse("T100", 1).unwrap();
        assert_eq!(timer.area, Area::Timer);
        assert_eq!(timer.start, 100);
        assert_eq!(timer.byte_offset(), 200);
        assert_eq!(timer.byte_len(), 2);

        let counter = AddressSpec::parse("C7", 3).unwrap();
        assert_eq!(counter.area, Area::Counter);
        assert_eq!(counter.start, 7);
        assert_eq!(counter.byte_len(), 6);
    }

    #[test]
    fn reject_malformed_addresses() {
        for text in [
            "", "X100", "M", "M1.8", "M1.2.3", "MA", "DB.100", "DB20", "DB20.", "DBx.1",
            "T1.1", "C", "DB70000.1", "M-1", "M99999999", "DB1.DBW4.3", "DB1.DBD0.1",
            "DB1.DBB2.0",
        ] {
            assert!(
                matches!(
                    AddressSpec::parse(text, 1),
                    Err(Error::AddressFormat { .. })
                ),
                "{text} should not parse"
            );
        }
    }

    #[test]
    fn parse_is_idempotent_through_display() {
        for text in ["M100", "I0.7", "Q12.1", "DB20.100.3", "V5", "T100", "C3", "AI8", "AQ10.4"] {
            let spec = AddressSpec::parse(text, 1).unwrap();
            let reparsed = AddressSpec::parse(&spec.to_string(), 1).unwrap();
            assert_eq!(spec, reparsed);
            assert_eq!(AddressSpec::parse(text, 1).unwrap(), spec);
        }
        assert_eq!("DB20.100.3".parse::<AddressSpec>().unwrap().to_string(), "DB20.100.3");
    }

    #[test]
    fn cursor_advances_per_area_granularity() {
        let mut db = AddressSpec::parse("DB1.0", 0).unwrap();
        db.advance(200);
        assert_eq!(db.byte_offset(), 200);
        assert_eq!(db.start, 1600);

        let mut timer = AddressSpec::parse("T10", 0).unwrap();
        timer.advance(200);
        assert_eq!(timer.start, 110);

        let mut counter = AddressSpec::parse("C0", 0).unwrap();
        assert!(counter.set_byte_len(3).is_err());
        counter.set_byte_len(8).unwrap();
        assert_eq!(counter.length, 4);
    }

    #[test]
    fn covering_byte_drops_bit_index() {
        let bit = AddressSpec::parse("M100.3", 1).unwrap();
        let byte = bit.covering_byte();
        assert_eq!(byte.start, 800);
        assert_eq!(byte.length, 1);
    }
}
