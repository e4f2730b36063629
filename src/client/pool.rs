use std::fmt;
use std::hash::Hash;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use bb8::{ManageConnection, Pool};

use super::create::{ClientOptions, S7Client, TCP_PORT};
use super::triggers::TriggerCollection;
use super::{Reader, Writer};
use crate::connection::iso::S7Types;
use crate::errors::{Error, Result};
use crate::s7_protocol::address::AddressSpec;

const DEFAULT_POOL_SIZE: u32 = 3;

pub(crate) struct S7ConnectionManager {
    addr: SocketAddr,
    options: ClientOptions,
}

#[async_trait]
impl ManageConnection for S7ConnectionManager {
    type Connection = S7Client;
    type Error = Error;

    async fn connect(&self) -> Result<S7Client> {
        S7Client::with_options(self.addr, self.options.clone()).await
    }

    async fn is_valid(&self, client: &mut S7Client) -> Result<()> {
        if client.is_closed() {
            return Err(Error::Connection("Pooled connection is closed".to_string()));
        }
        Ok(())
    }

    fn has_broken(&self, client: &mut S7Client) -> bool {
        client.is_closed()
    }
}

/// Pooled connection to a PLC device from the S7 family
///
/// Every call checks out one session for its whole duration, sessions that
/// broke during a call are replaced by the pool.
#[derive(Clone)]
pub struct S7Pool(Pool<S7ConnectionManager>);

impl fmt::Debug for S7Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state();
        f.debug_struct("S7Pool")
            .field("connections", &state.connections)
            .field("idle_connections", &state.idle_connections)
            .finish()
    }
}

impl S7Pool {
    /// Create new pooled connection to an S7 PLC on port 102
    ///```rust, no_run
    /// use std::net::Ipv4Addr;
    /// use s7link::{S7Pool, S7Types};
    ///
    /// // create S7 pool, sessions are opened on first use
    /// let pool = S7Pool::new(Ipv4Addr::new(127, 0, 0, 1), S7Types::S71200);
    /// ```
    pub fn new(ip: Ipv4Addr, s7_type: S7Types) -> Self {
        Self::with_options(
            SocketAddr::from((ip, TCP_PORT)),
            ClientOptions::new(s7_type),
            DEFAULT_POOL_SIZE,
        )
    }

    /// Create a pool of at most `max_size` sessions with explicit connection parameters.
    ///
    /// Must be called inside a tokio runtime, sessions are opened on first use.
    pub fn with_options(addr: SocketAddr, options: ClientOptions, max_size: u32) -> Self {
        let manager = S7ConnectionManager { addr, options };
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .build_unchecked(manager);

        S7Pool(pool)
    }

    /// Create a collection of observed bits, identified by `T`
    ///```rust, no_run
    /// # tokio_test::block_on(async {
    /// use std::net::Ipv4Addr;
    /// use s7link::{S7Pool, S7Types};
    ///
    /// let pool = S7Pool::new(Ipv4Addr::new(127, 0, 0, 1), S7Types::S71200);
    /// let mut triggers = pool.new_trigger_collection(&[("start", "M10.0"), ("stop", "DB1.2.5")])?;
    ///
    /// triggers.update().await?;
    /// if triggers.positive_flank("start") == Some(true) {
    ///     // start was switched on since the previous update
    /// }
    /// # Ok::<(), s7link::errors::Error>(())
    /// # });
    /// ```
    /// # Errors
    ///
    /// Will return `Error::AddressFormat` if one of the addresses is not a bit address.
    pub fn new_trigger_collection<T>(
        &self,
        triggers: &[(T, &str)],
    ) -> Result<TriggerCollection<T, Self>>
    where
        T: Hash + Eq + Clone + Send + Sync,
    {
        TriggerCollection::new(self.clone(), triggers)
    }
}

#[async_trait]
impl Reader for S7Pool {
    async fn read_bytes(&self, address: &str, length: usize) -> Result<Vec<u8>> {
        self.0.get().await?.read_bytes(address, length).await
    }

    async fn read_multi(&self, items: &[AddressSpec]) -> Result<Vec<u8>> {
        self.0.get().await?.read_multi(items).await
    }

    async fn read_bool(&self, address: &str) -> Result<bool> {
        self.0.get().await?.read_bool(address).await
    }

    async fn read_bools(&self, address: &str, count: usize) -> Result<Vec<bool>> {
        self.0.get().await?.read_bools(address, count).await
    }

    async fn read_string(&self, address: &str) -> Result<String> {
        self.0.get().await?.read_string(address).await
    }

    async fn read_wstring(&self, address: &str) -> Result<String> {
        self.0.get().await?.read_wstring(address).await
    }
}

#[async_trait]
impl Writer for S7Pool {
    async fn write_bytes(&self, address: &str, data: &[u8]) -> Result<()> {
        self.0.get().await?.write_bytes(address, data).await
    }

    async fn write_bool(&self, address: &str, value: bool) -> Result<()> {
        self.0.get().await?.write_bool(address, value).await
    }

    async fn write_bools(&self, address: &str, values: &[bool]) -> Result<()> {
        self.0.get().await?.write_bools(address, values).await
    }

    async fn write_string(&self, address: &str, value: &str) -> Result<()> {
        self.0.get().await?.write_string(address, value).await
    }

    async fn write_wstring(&self, address: &str, value: &str) -> Result<()> {
        self.0.get().await?.write_wstring(address, value).await
    }
}
