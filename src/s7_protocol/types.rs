use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

pub(crate) const READ_OPERATION: u8 = 0x04;
pub(crate) const WRITE_OPERATION: u8 = 0x05;
pub(crate) const SETUP_COMMUNICATION: u8 = 0xF0;

pub(crate) const SPEC_TYPE_READ_WRITE: u8 = 0x12;
pub(crate) const SYNTAX_ID_ANY_TYPE: u8 = 0x10;

/// Most request items a single read frame may carry
pub const MAX_ITEMS_PER_REQUEST: usize = 19;

/// Largest address that fits the 3-byte address field of a request item
pub(crate) const MAX_WIRE_ADDRESS: u32 = 0x00FF_FFFF;

/// 0xFF signals success for a data item
pub(crate) const ITEM_SUCCESS: u8 = 0xFF;

/// Memory areas of an S7 PLC
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Area {
    /// Process image of the inputs (`I`)
    Input,
    /// Process image of the outputs (`Q`)
    Output,
    /// Merkers are address registers within the CPU (`M`)
    Memory,
    /// Data blocks (`DB`, `V` on the S7 200 family)
    DataBlock,
    /// Counters (`C`), addressed per 16 bit word
    Counter,
    /// Timers (`T`), addressed per 16 bit word
    Timer,
    /// Analog inputs (`AI`)
    AnalogIn,
    /// Analog outputs (`AQ`)
    AnalogOut,
}

impl Area {
    /// Area code used on the wire
    pub fn code(self) -> u8 {
        match self {
            Self::Input => 0x81,
            Self::Output => 0x82,
            Self::Memory => 0x83,
            Self::DataBlock => 0x84,
            Self::Counter => 0x1C,
            Self::Timer => 0x1D,
            Self::AnalogIn => 0x06,
            Self::AnalogOut => 0x07,
        }
    }

    /// Resolve a wire area code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x81 => Some(Self::Input),
            0x82 => Some(Self::Output),
            0x83 => Some(Self::Memory),
            0x84 => Some(Self::DataBlock),
            0x1C => Some(Self::Counter),
            0x1D => Some(Self::Timer),
            0x06 => Some(Self::AnalogIn),
            0x07 => Some(Self::AnalogOut),
            _ => None,
        }
    }

    /// Counters and timers are addressed in words, everything else in bits
    pub fn is_word_area(self) -> bool {
        matches!(self, Self::Counter | Self::Timer)
    }

    /// Transport unit of a read or write descriptor for this area
    pub(crate) fn transport_unit(self) -> S7DataTypes {
        match self {
            Self::Counter => S7DataTypes::S7COUNTER,
            Self::Timer => S7DataTypes::S7TIMER,
            _ => S7DataTypes::S7BYTE,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum S7DataTypes {
    S7BIT = 0x01,     // Bit (inside a word)
    S7BYTE = 0x02,    // Byte (8 bit)
    S7COUNTER = 0x1C, // Counter (16 bit)
    S7TIMER = 0x1D,   // Timer (16 bit)
}

impl S7DataTypes {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::S7BIT),
            0x02 => Some(Self::S7BYTE),
            0x1C => Some(Self::S7COUNTER),
            0x1D => Some(Self::S7TIMER),
            _ => None,
        }
    }
}

/// Transport size of a data item in a write request or a read response
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DataItemTransportSize {
    Null = 0x00,        // Null
    Bit = 0x03,         // Bit, length given in bits
    Byte = 0x04,        // Byte/Word/DWord, length given in bits
    OctetString = 0x09, // Octet String, length given in bytes
}

impl From<u8> for DataItemTransportSize {
    fn from(val: u8) -> Self {
        match val {
            0x03 => Self::Bit,
            0x04 => Self::Byte,
            0x09 => Self::OctetString,
            _ => Self::Null,
        }
    }
}

impl DataItemTransportSize {
    /// Number of payload bytes described by the length field of a data item
    pub(crate) fn payload_len(self, length_field: u16) -> usize {
        let length = usize::from(length_field);
        match self {
            Self::Null => 0,
            Self::Bit => length.div_ceil(8),
            Self::Byte => length / 8,
            Self::OctetString => length,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RequestItem {
    pub(crate) var_type: u8, // Transport unit: bit, byte or the counter/timer area code
    pub(crate) data_length: u16, // Number of units to transfer
    pub(crate) db_number: u16, // Ignored unless the area is DB
    pub(crate) area: u8, // Selects the memory area of the addressed variable
    pub(crate) address: u32, // Bit offset for byte areas, word index for counters and timers.
                         // Encoded on 3 bytes in network byte order,
                         // e.g. DBX40.3 is 0x000143 which is 40 * 8 + 3.
}

impl RequestItem {
    pub(crate) fn len() -> usize {
        // address is only 3 bytes long (not u32 as in struct)
        12
    }

    pub(crate) fn put(&self, bytes: &mut BytesMut) {
        bytes.put_u8(SPEC_TYPE_READ_WRITE);
        bytes.put_u8(10); // length of the rest of the item
        bytes.put_u8(SYNTAX_ID_ANY_TYPE);
        bytes.put_u8(self.var_type);
        bytes.put_u16(self.data_length);
        bytes.put_u16(self.db_number);
        bytes.put_u8(self.area);
        bytes.put_slice(&self.address.to_be_bytes()[1..]);
    }

    /// Decode a 12 byte descriptor as it is found in read and write jobs
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [SPEC_TYPE_READ_WRITE, 10, SYNTAX_ID_ANY_TYPE, var_type, len_hi, len_lo, db_hi, db_lo, area, a1, a2, a3, ..] => {
                Ok(Self {
                    var_type: *var_type,
                    data_length: u16::from_be_bytes([*len_hi, *len_lo]),
                    db_number: u16::from_be_bytes([*db_hi, *db_lo]),
                    area: *area,
                    address: u32::from_be_bytes([0, *a1, *a2, *a3]),
                })
            }
            _ => Err(Error::length_check("Malformed request item", bytes)),
        }
    }
}
