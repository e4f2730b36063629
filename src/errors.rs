//! Types for working with errors produced by s7link.

use std::fmt;
use std::io::{Error as IOError, ErrorKind};

use bb8::RunError;
use thiserror::Error as ThisError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a read, write, handshake or server operation can report
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The textual address could not be parsed
    #[error("Invalid address '{address}': {reason}")]
    AddressFormat {
        /// The address as given by the caller
        address: String,
        /// What is wrong with it
        reason: String,
    },
    /// The ISO connect or the PDU negotiation failed
    #[error("Connection setup failed: {0}")]
    ConnectionSetup(String),
    /// The session is closed or could not be opened
    #[error("Connection error: {0}")]
    Connection(String),
    /// Socket level failure
    #[error("IO error ({kind}): {message}")]
    Transport {
        /// Kind of the underlying IO error
        kind: ErrorKind,
        /// Message of the underlying IO error
        message: String,
    },
    /// The exchange timeout configured for the session elapsed
    #[error("Timeout during data exchange")]
    Timeout,
    /// The operation was cancelled by the caller
    #[error("The operation was cancelled")]
    Cancelled,
    /// The device answered with a non-success status
    #[error("S7 status 0x{code:02X}: {message}")]
    ProtocolStatus {
        /// Raw status code (item status byte, or error class and code of the header)
        code: u16,
        /// Human readable meaning of the code
        message: String,
    },
    /// The response does not have the shape the request asked for
    #[error("Data length check failed: {message} (frame: {raw_hex})")]
    DataLengthCheckFailed {
        /// What did not match
        message: String,
        /// Hex dump of the received frame
        raw_hex: String,
    },
    /// A string does not fit the capacity declared in the PLC
    #[error("String of length {length} exceeds the declared capacity of {max}")]
    StringTooLong {
        /// Length of the value that should be written
        length: usize,
        /// Declared capacity of the target
        max: usize,
    },
    /// The virtual server does not model the requested area
    #[error("Area 0x{area:02X} (DB {db_number}) is not supported")]
    UnsupportedArea {
        /// Area code of the request
        area: u8,
        /// Data block number of the request
        db_number: u16,
    },
    /// The virtual server is read-only
    #[error("Writing is disabled on this server")]
    WriteDisabled,
    /// A length argument is outside the allowed range
    #[error("Invalid length: {0}")]
    InvalidLength(String),
    /// Raw bytes could not be converted into the requested value
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    /// A memory snapshot has the wrong size
    #[error("Snapshot has {actual} bytes, expected {expected}")]
    Snapshot {
        /// Size of a complete snapshot
        expected: usize,
        /// Size of the rejected blob
        actual: usize,
    },
    /// No pooled connection could be handed out
    #[error("Pool error: {0}")]
    Pool(String),
}

impl Error {
    pub(crate) fn address(address: &str, reason: impl Into<String>) -> Self {
        Self::AddressFormat {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn length_check(message: impl Into<String>, frame: &[u8]) -> Self {
        Self::DataLengthCheckFailed {
            message: message.into(),
            raw_hex: hex::encode_upper(frame),
        }
    }

    pub(crate) fn status(code: u8) -> Self {
        Self::ProtocolStatus {
            code: u16::from(code),
            message: S7DataItemResponseError::from(code).to_string(),
        }
    }

    pub(crate) fn write_status(code: u8) -> Self {
        Self::ProtocolStatus {
            code: u16::from(code),
            message: format!("Write rejected: {}", S7DataItemResponseError::from(code)),
        }
    }

    /// Errors after which the byte stream of a session can no longer be trusted
    pub(crate) fn breaks_session(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout | Self::Cancelled
        )
    }
}

impl From<IOError> for Error {
    fn from(e: IOError) -> Self {
        Error::Transport {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<RunError<Error>> for Error {
    fn from(e: RunError<Error>) -> Self {
        match e {
            RunError::User(e) => e,
            RunError::TimedOut => {
                Error::Pool("Timed out waiting for a pooled connection".to_string())
            }
        }
    }
}

/// S7 protocol error reported in the header of an ack-data frame
#[derive(Debug)]
pub struct S7ProtocolError {
    /// Error class
    class: &'static str,
    /// Error code
    error: Option<u8>,
}

impl fmt::Display for S7ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut error = vec![format!("S7 Protocol error: {}", &self.class)];
        if let Some(error_code) = self.error {
            error.push(format!("error code: {error_code}"));
        }
        write!(f, "{}", error.join(" - "))
    }
}

impl S7ProtocolError {
    pub(crate) fn from_codes(class: Option<u8>, code: Option<u8>) -> Self {
        Self {
            class: match class {
                Some(class_code) => match class_code {
                    0x00 => "No error",
                    0x81 => "Application relationship error",
                    0x82 => "Object definition error",
                    0x83 => "No resources available error",
                    0x84 => "Error on service processing",
                    0x85 => "Error on supplies",
                    0x87 => "Access error",
                    _ => "Unknown error class",
                },
                None => "No error class given",
            },
            error: code,
        }
    }
}

/// Errors from a data item included inside a S7 PLC response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7DataItemResponseError {
    /// Reserved
    Reserved,
    /// Hardware fault
    HardwareFault,
    /// Accessing the object is not allowed
    AccessNotAllowed,
    /// The requested length exceeds the area size assigned by the device
    AddressOutOfRange,
    /// Data type is not supported
    DataTypeNotSupported,
    /// Inconsistencies in the data type occurred
    DataTypeInconsistent,
    /// Requested object does not exist
    ObjectDoesNotExist,
    /// Unknown error
    Unknown,
}

impl fmt::Display for S7DataItemResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Reserved => "Reserved",
            Self::HardwareFault => "Hardware fault",
            Self::AccessNotAllowed => "Accessing the object not allowed",
            Self::AddressOutOfRange => {
                "Address out of range, the requested length exceeds the area assigned by the device"
            }
            Self::DataTypeNotSupported => "Data type not supported",
            Self::DataTypeInconsistent => "Data type inconsistent",
            Self::ObjectDoesNotExist => "Object does not exist, check the area and block number",
            Self::Unknown => "Unknown error",
        };
        write!(f, "{msg}")
    }
}

impl From<u8> for S7DataItemResponseError {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::Reserved,
            0x01 => Self::HardwareFault,
            0x03 => Self::AccessNotAllowed,
            0x05 => Self::AddressOutOfRange,
            0x06 => Self::DataTypeNotSupported,
            0x07 => Self::DataTypeInconsistent,
            0x0a => Self::ObjectDoesNotExist,
            _ => Self::Unknown,
        }
    }
}
