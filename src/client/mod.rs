use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::errors::Result;
use crate::s7_protocol::address::AddressSpec;
use crate::s7_protocol::codec::{
    decode_datetime, decode_word, decode_words, encode_datetime, encode_words, WordValue,
    DATE_TIME_LEN,
};

pub(crate) mod create;
pub(crate) mod pool;
pub(crate) mod read;
pub(crate) mod triggers;
pub(crate) mod write;

/// Read access to a PLC, implemented by [`S7Client`](crate::S7Client) and [`S7Pool`](crate::S7Pool)
#[async_trait]
pub trait Reader: Send + Sync {
    /// Read `length` bytes starting at `address`
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    async fn read_bytes(&self, address: &str, length: usize) -> Result<Vec<u8>>;

    /// Read several items, batched into as few jobs as possible
    /// # Errors
    ///
    /// Will return `Error` if any job fails.
    async fn read_multi(&self, items: &[AddressSpec]) -> Result<Vec<u8>>;

    /// Read a single bit
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    async fn read_bool(&self, address: &str) -> Result<bool>;

    /// Read `count` consecutive bits
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    async fn read_bools(&self, address: &str, count: usize) -> Result<Vec<bool>>;

    /// Read an S7 `STRING`
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    async fn read_string(&self, address: &str) -> Result<String>;

    /// Read an S7 `WSTRING`
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    async fn read_wstring(&self, address: &str) -> Result<String>;

    /// Read one big-endian value such as an `i16` (INT) or `f32` (REAL)
    ///
    /// ```rust, ignore
    /// let speed: f32 = client.read_value("DB10.4").await?;
    /// ```
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    async fn read_value<T: WordValue>(&self, address: &str) -> Result<T> {
        let bytes = self.read_bytes(address, T::SIZE).await?;
        decode_word(&bytes)
    }

    /// Read `count` consecutive big-endian values
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    async fn read_values<T: WordValue>(&self, address: &str, count: usize) -> Result<Vec<T>> {
        let bytes = self.read_bytes(address, count * T::SIZE).await?;
        decode_words(&bytes)
    }

    /// Read a `DATE_AND_TIME` value
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading or the bytes
    /// are not a valid date.
    async fn read_datetime(&self, address: &str) -> Result<NaiveDateTime> {
        let bytes = self.read_bytes(address, DATE_TIME_LEN).await?;
        decode_datetime(&bytes)
    }
}

/// Write access to a PLC, implemented by [`S7Client`](crate::S7Client) and [`S7Pool`](crate::S7Pool)
#[async_trait]
pub trait Writer: Send + Sync {
    /// Write `data` starting at `address`
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during writing.
    async fn write_bytes(&self, address: &str, data: &[u8]) -> Result<()>;

    /// Set or clear a single bit
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during writing.
    async fn write_bool(&self, address: &str, value: bool) -> Result<()>;

    /// Write consecutive bits, keeping the other bits of the touched bytes
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during writing.
    async fn write_bools(&self, address: &str, values: &[bool]) -> Result<()>;

    /// Write an S7 `STRING`
    /// # Errors
    ///
    /// Will return `Error::StringTooLong` if the value exceeds the declared capacity.
    async fn write_string(&self, address: &str, value: &str) -> Result<()>;

    /// Write an S7 `WSTRING`
    /// # Errors
    ///
    /// Will return `Error::StringTooLong` if the value exceeds the declared capacity.
    async fn write_wstring(&self, address: &str, value: &str) -> Result<()>;

    /// Write one big-endian value
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during writing.
    async fn write_value<T: WordValue>(&self, address: &str, value: T) -> Result<()> {
        self.write_bytes(address, &encode_words(&[value])).await
    }

    /// Write consecutive big-endian values
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during writing.
    async fn write_values<T: WordValue>(&self, address: &str, values: &[T]) -> Result<()> {
        self.write_bytes(address, &encode_words(values)).await
    }

    /// Write a `DATE_AND_TIME` value
    /// # Errors
    ///
    /// Will return `Error` if the date cannot be encoded or writing failed.
    async fn write_datetime(&self, address: &str, value: &NaiveDateTime) -> Result<()> {
        let bytes = encode_datetime(value)?;
        self.write_bytes(address, &bytes).await
    }
}
