use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::create::S7Client;
use super::Reader;
use crate::connection::Exchange;
use crate::errors::{Error, Result};
use crate::s7_protocol::address::AddressSpec;
use crate::s7_protocol::codec::{
    bit_window, bytes_to_bools, decode_string, decode_wstring, DEFAULT_STRING_CAPACITY,
};
use crate::s7_protocol::read_area::{read_area, read_area_multi, read_bit};

/// Parse an address for byte access
pub(crate) fn byte_address(address: &str) -> Result<AddressSpec> {
    let spec = AddressSpec::parse(address, 0)?;
    if spec.bit_index() != 0 {
        return Err(Error::address(address, "byte access needs an address without bit index"));
    }
    Ok(spec)
}

/// Parse an address for bit access
pub(crate) fn bit_address(address: &str) -> Result<AddressSpec> {
    let spec = AddressSpec::parse(address, 1)?;
    if spec.area.is_word_area() {
        return Err(Error::address(address, "counters and timers have no bit access"));
    }
    Ok(spec)
}

/// Byte aligned region covering `count` bits from `spec`
pub(crate) fn covering_bytes(spec: &AddressSpec, count: usize) -> (AddressSpec, usize, usize) {
    let (byte_start, byte_len, offset) = bit_window(spec.start, count);
    let covering = AddressSpec {
        start: byte_start * 8,
        ..*spec
    };
    (covering, byte_len, offset)
}

pub(crate) async fn read_bools<E: Exchange>(
    ex: &mut E,
    spec: &AddressSpec,
    count: usize,
) -> Result<Vec<bool>> {
    let (covering, byte_len, offset) = covering_bytes(spec, count);
    let bytes = read_area(ex, covering, byte_len).await?;
    Ok(bytes_to_bools(&bytes, offset, count))
}

pub(crate) async fn read_string<E: Exchange>(ex: &mut E, spec: &AddressSpec) -> Result<String> {
    let header = read_area(ex, *spec, 2).await?;
    let max = match usize::from(header[0]) {
        0 => DEFAULT_STRING_CAPACITY,
        max => max,
    };
    let current = usize::from(header[1]).min(max);

    let mut raw = header;
    if current > 0 {
        let mut payload = *spec;
        payload.advance(2);
        raw.extend(read_area(ex, payload, current).await?);
    }
    decode_string(&raw)
}

pub(crate) async fn read_wstring<E: Exchange>(ex: &mut E, spec: &AddressSpec) -> Result<String> {
    let header = read_area(ex, *spec, 4).await?;
    let max = match usize::from(u16::from_be_bytes([header[0], header[1]])) {
        0 => DEFAULT_STRING_CAPACITY,
        max => max,
    };
    let current = usize::from(u16::from_be_bytes([header[2], header[3]])).min(max);

    let mut raw = header;
    if current > 0 {
        let mut payload = *spec;
        payload.advance(4);
        raw.extend(read_area(ex, payload, current * 2).await?);
    }
    decode_wstring(&raw)
}

/// *Methods for reading from the PLC device*
///
/// Each method holds the session for the whole operation. When `cancel` fires
/// the operation is aborted and the session is closed, since a response may
/// still be pending on the stream.
impl S7Client {
    /// Read `length` bytes starting at `address`, split over several jobs if needed
    ///
    /// # Example
    /// ```rust, ignore
    /// let data = client.read_bytes_with_cancel("DB100.0", 4, &cancel)
    ///     .await
    ///     .expect("Could not read from S7 PLC");
    /// ```
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    pub async fn read_bytes_with_cancel(
        &self,
        address: &str,
        length: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let spec = byte_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = read_area(&mut *session, spec, length) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }

    /// Read several items, at most 19 per job, and concatenate their payloads
    /// # Errors
    ///
    /// Will return `Error` if any job fails, no partial result is returned.
    pub async fn read_multi_with_cancel(
        &self,
        items: &[AddressSpec],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = read_area_multi(&mut *session, items) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }

    /// Read a single bit such as `M100.3`
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    pub async fn read_bool_with_cancel(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let spec = bit_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = read_bit(&mut *session, &spec) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }

    /// Read `count` consecutive bits starting at `address`
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    pub async fn read_bools_with_cancel(
        &self,
        address: &str,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<bool>> {
        let spec = bit_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = read_bools(&mut *session, &spec, count) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }

    /// Read an S7 `STRING` stored at `address`
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    pub async fn read_string_with_cancel(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let spec = byte_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = read_string(&mut *session, &spec) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }

    /// Read an S7 `WSTRING` stored at `address`
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading.
    pub async fn read_wstring_with_cancel(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let spec = byte_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = read_wstring(&mut *session, &spec) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }
}

#[async_trait]
impl Reader for S7Client {
    async fn read_bytes(&self, address: &str, length: usize) -> Result<Vec<u8>> {
        self.read_bytes_with_cancel(address, length, &CancellationToken::new())
            .await
    }

    async fn read_multi(&self, items: &[AddressSpec]) -> Result<Vec<u8>> {
        self.read_multi_with_cancel(items, &CancellationToken::new())
            .await
    }

    async fn read_bool(&self, address: &str) -> Result<bool> {
        self.read_bool_with_cancel(address, &CancellationToken::new())
            .await
    }

    async fn read_bools(&self, address: &str, count: usize) -> Result<Vec<bool>> {
        self.read_bools_with_cancel(address, count, &CancellationToken::new())
            .await
    }

    async fn read_string(&self, address: &str) -> Result<String> {
        self.read_string_with_cancel(address, &CancellationToken::new())
            .await
    }

    async fn read_wstring(&self, address: &str) -> Result<String> {
        self.read_wstring_with_cancel(address, &CancellationToken::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::dispatcher::Loopback;
    use crate::server::memory::ArenaId;

    #[test]
    fn address_kinds() {
        assert!(byte_address("M100").is_ok());
        assert!(matches!(
            byte_address("M100.1"),
            Err(Error::AddressFormat { .. })
        ));
        assert!(bit_address("T3").is_err());

        let (covering, len, offset) = covering_bytes(&bit_address("M10.6").unwrap(), 4);
        assert_eq!(covering.to_string(), "M10");
        assert_eq!((len, offset), (2, 6));
    }

    #[tokio::test]
    async fn bool_ranges_cross_byte_borders() {
        let mut ex = Loopback::new(480);
        ex.memory().write(ArenaId::Memory, 10, &[0b1100_0000, 0b0000_0001]);

        let bits = read_bools(&mut ex, &bit_address("M10.6").unwrap(), 4)
            .await
            .unwrap();
        assert_eq!(bits, vec![true, true, true, false]);
    }

    #[tokio::test]
    async fn strings_honour_current_length() {
        let mut ex = Loopback::new(480);
        ex.memory().write(ArenaId::Db1, 0, &[10, 5, b'h', b'e', b'l', b'l', b'o', b'!']);
        let value = read_string(&mut ex, &byte_address("DB1.0").unwrap())
            .await
            .unwrap();
        assert_eq!(value, "hello");

        ex.memory().write(ArenaId::Db1, 20, &[0, 4, 0, 2, 0, b'o', 0, b'k']);
        let value = read_wstring(&mut ex, &byte_address("DB1.20").unwrap())
            .await
            .unwrap();
        assert_eq!(value, "ok");
    }
}
