use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::create::S7Client;
use super::read::{bit_address, byte_address, covering_bytes};
use super::Writer;
use crate::connection::Exchange;
use crate::errors::{Error, Result};
use crate::s7_protocol::address::AddressSpec;
use crate::s7_protocol::codec::{encode_string, encode_wstring, overlay_bools};
use crate::s7_protocol::read_area::read_area;
use crate::s7_protocol::write_area::{write_area, write_bit};

pub(crate) async fn write_bools<E: Exchange>(
    ex: &mut E,
    spec: &AddressSpec,
    values: &[bool],
) -> Result<()> {
    if values.is_empty() {
        return Err(Error::InvalidLength("no bits to write".to_string()));
    }
    let (covering, byte_len, offset) = covering_bytes(spec, values.len());
    let mut bytes = read_area(ex, covering, byte_len).await?;
    overlay_bools(&mut bytes, offset, values);
    write_area(ex, covering, &bytes).await
}

pub(crate) async fn write_string<E: Exchange>(
    ex: &mut E,
    spec: &AddressSpec,
    value: &str,
) -> Result<()> {
    let header = read_area(ex, *spec, 2).await?;
    let encoded = encode_string(value, header[0])?;
    write_area(ex, *spec, &encoded).await
}

pub(crate) async fn write_wstring<E: Exchange>(
    ex: &mut E,
    spec: &AddressSpec,
    value: &str,
) -> Result<()> {
    let header = read_area(ex, *spec, 4).await?;
    let encoded = encode_wstring(value, u16::from_be_bytes([header[0], header[1]]))?;
    write_area(ex, *spec, &encoded).await
}

/// *Methods for writing to the PLC device*
///
/// Like the read methods each call holds the session until it is done, so
/// read-modify-write sequences are not interleaved with other requests.
impl S7Client {
    /// Write `data` starting at `address`, split over several jobs if needed
    ///
    /// # Example
    /// ```rust, ignore
    /// client.write_bytes_with_cancel("DB100.0", &[0x01, 0x02], &cancel)
    ///     .await
    ///     .expect("Could not write to S7 PLC");
    /// ```
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during writing. Jobs already
    /// acknowledged are not rolled back.
    pub async fn write_bytes_with_cancel(
        &self,
        address: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = byte_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = write_area(&mut *session, spec, data) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }

    /// Set or clear a single bit, the other bits of the byte are left alone
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during writing.
    pub async fn write_bool_with_cancel(
        &self,
        address: &str,
        value: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = bit_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = write_bit(&mut *session, &spec, value) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }

    /// Write consecutive bits starting at `address`.
    ///
    /// The covering bytes are read, patched and written back while the session
    /// is held.
    /// # Errors
    ///
    /// Will return `Error` if any errors occurred during reading or writing.
    pub async fn write_bools_with_cancel(
        &self,
        address: &str,
        values: &[bool],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = bit_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = write_bools(&mut *session, &spec, values) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }

    /// Write an S7 `STRING` within the capacity declared in the PLC
    /// # Errors
    ///
    /// Will return `Error::StringTooLong` without writing anything if the value
    /// exceeds the declared capacity.
    pub async fn write_string_with_cancel(
        &self,
        address: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = byte_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = write_string(&mut *session, &spec, value) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }

    /// Write an S7 `WSTRING` within the capacity declared in the PLC
    /// # Errors
    ///
    /// Will return `Error::StringTooLong` without writing anything if the value
    /// exceeds the declared capacity.
    pub async fn write_wstring_with_cancel(
        &self,
        address: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = byte_address(address)?;
        let mut session = self.lock(cancel).await?;
        let result = tokio::select! {
            result = write_wstring(&mut *session, &spec, value) => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.settle(&mut session, result)
    }
}

#[async_trait]
impl Writer for S7Client {
    async fn write_bytes(&self, address: &str, data: &[u8]) -> Result<()> {
        self.write_bytes_with_cancel(address, data, &CancellationToken::new())
            .await
    }

    async fn write_bool(&self, address: &str, value: bool) -> Result<()> {
        self.write_bool_with_cancel(address, value, &CancellationToken::new())
            .await
    }

    async fn write_bools(&self, address: &str, values: &[bool]) -> Result<()> {
        self.write_bools_with_cancel(address, values, &CancellationToken::new())
            .await
    }

    async fn write_string(&self, address: &str, value: &str) -> Result<()> {
        self.write_string_with_cancel(address, value, &CancellationToken::new())
            .await
    }

    async fn write_wstring(&self, address: &str, value: &str) -> Result<()> {
        self.write_wstring_with_cancel(address, value, &CancellationToken::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::dispatcher::Loopback;
    use crate::server::memory::ArenaId;

    #[tokio::test]
    async fn bool_ranges_keep_neighbours() {
        let mut ex = Loopback::new(480);
        ex.memory().write(ArenaId::Memory, 10, &[0b0011_1111, 0b1111_1110]);

        let spec = bit_address("M10.6").unwrap();
        write_bools(&mut ex, &spec, &[true, false, true]).await.unwrap();
        assert_eq!(
            ex.memory().read(ArenaId::Memory, 10, 2).unwrap(),
            vec![0b0111_1111, 0b1111_1111]
        );
    }

    #[tokio::test]
    async fn strings_respect_declared_capacity() {
        let mut ex = Loopback::new(480);
        ex.memory().write(ArenaId::Db2, 0, &[4, 0]);
        let spec = byte_address("DB2.0").unwrap();

        write_string(&mut ex, &spec, "abc").await.unwrap();
        assert_eq!(
            ex.memory().read(ArenaId::Db2, 0, 5).unwrap(),
            vec![4, 3, b'a', b'b', b'c']
        );

        let exchanges = ex.exchanges();
        assert_eq!(
            write_string(&mut ex, &spec, "too long").await,
            Err(Error::StringTooLong { length: 8, max: 4 })
        );
        // only the header was read
        assert_eq!(ex.exchanges(), exchanges + 1);
        assert_eq!(ex.memory().read(ArenaId::Db2, 1, 1).unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn wstrings_are_utf16() {
        let mut ex = Loopback::new(480);
        ex.memory().write(ArenaId::Db3, 0, &[0, 10]);
        let spec = byte_address("DB3.0").unwrap();

        write_wstring(&mut ex, &spec, "Grüße").await.unwrap();
        let raw = ex.memory().read(ArenaId::Db3, 0, 6).unwrap();
        assert_eq!(raw, vec![0, 10, 0, 5, 0, b'G']);
    }
}
