//! A virtual S7 PLC answering the same frames a real device does.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::tcp::{recv_frame, send_frame};
use crate::errors::{Error, Result};
use crate::s7_protocol::address::AddressSpec;

use dispatcher::{ConnectionState, Outcome, RequestDispatcher};
use memory::{ArenaId, VirtualMemoryStore};

pub(crate) mod dispatcher;
pub(crate) mod memory;

/// Configuration of the virtual PLC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// TCP port used by [`S7Server::start`]
    pub port: u16,
    /// PDU size announced in the setup communication response
    pub pdu_size: u16,
    /// Reject every write with status 0x03 when false
    pub write_enabled: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 102,
            pdu_size: 480,
            write_enabled: true,
        }
    }
}

impl ServerOptions {
    /// Set the TCP port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the announced PDU size
    #[must_use]
    pub fn pdu_size(mut self, pdu_size: u16) -> Self {
        self.pdu_size = pdu_size;
        self
    }

    /// Allow or reject writes
    #[must_use]
    pub fn write_enabled(mut self, write_enabled: bool) -> Self {
        self.write_enabled = write_enabled;
        self
    }
}

/// Virtual S7 PLC serving nine memory arenas over ISO-on-TCP
///
///```rust
/// # tokio_test::block_on(async {
/// use s7link::{S7Server, ServerOptions};
///
/// let server = S7Server::new(ServerOptions::default());
/// let _addr = server.bind("127.0.0.1:0".parse().unwrap()).await?;
/// server.write_bytes("M100", &[1, 2])?;
/// assert_eq!(server.read_bytes("M100", 2)?, vec![1, 2]);
/// server.shutdown();
/// # Ok::<(), s7link::errors::Error>(())
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct S7Server {
    options: ServerOptions,
    memory: Arc<VirtualMemoryStore>,
    served: Arc<AtomicU64>,
    online: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl S7Server {
    /// Create a server with zeroed memory, nothing is bound yet
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            memory: Arc::new(VirtualMemoryStore::new()),
            served: Arc::default(),
            online: Arc::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Memory arenas of this server
    pub fn memory(&self) -> &VirtualMemoryStore {
        &self.memory
    }

    /// Listen on all interfaces at the configured port
    /// # Errors
    ///
    /// Will return `Error::Transport` if the port could not be bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.options.port)))
            .await
    }

    /// Listen on `addr` and accept connections in a background task.
    ///
    /// Returns the bound address, which tells the port when binding port 0.
    /// # Errors
    ///
    /// Will return `Error::Transport` if the address could not be bound.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let server = self.clone();
        tokio::spawn(async move { server.serve(listener).await });

        Ok(local_addr)
    }

    /// Accept connections on `listener` until [`S7Server::shutdown`] is called
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "S7 server listening");
        }
        let dispatcher = RequestDispatcher::new(
            Arc::clone(&self.memory),
            &self.options,
            Arc::clone(&self.served),
        );

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = self.shutdown.cancelled() => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "accepted connection");
                    self.online.fetch_add(1, Ordering::SeqCst);
                    let dispatcher = dispatcher.clone();
                    let online = Arc::clone(&self.online);
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(&dispatcher, stream, &shutdown).await;
                        online.fetch_sub(1, Ordering::SeqCst);
                        debug!(%peer, "connection closed");
                    });
                }
                Err(err) => warn!(%err, "accept failed"),
            }
        }
        info!("S7 server stopped");
    }

    /// Stop accepting and close every open connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of currently open client connections
    pub fn online_connections(&self) -> usize {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of read and write jobs answered so far
    pub fn served_requests(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Read `length` bytes at a textual address
    /// # Errors
    ///
    /// Will return `Error::AddressFormat` for malformed addresses,
    /// `Error::UnsupportedArea` for analog areas and `Error::InvalidLength`
    /// if the range leaves the arena.
    pub fn read_bytes(&self, address: &str, length: usize) -> Result<Vec<u8>> {
        let (arena, spec) = resolve(address)?;
        self.memory
            .read(arena, spec.byte_offset() as usize, length)
    }

    /// Write `data` at a textual address, clamped to the end of the arena.
    ///
    /// Returns the number of bytes written.
    /// # Errors
    ///
    /// Will return `Error::AddressFormat` for malformed addresses and
    /// `Error::UnsupportedArea` for analog areas.
    pub fn write_bytes(&self, address: &str, data: &[u8]) -> Result<usize> {
        let (arena, spec) = resolve(address)?;
        Ok(self.memory.write(arena, spec.byte_offset() as usize, data))
    }

    /// Read the bit at a textual address such as `M100.3`
    /// # Errors
    ///
    /// Will return `Error::AddressFormat` for malformed or word addresses.
    pub fn read_bool(&self, address: &str) -> Result<bool> {
        let (arena, spec) = resolve_bit(address)?;
        self.memory.get_bit(arena, spec.start as usize)
    }

    /// Set or clear the bit at a textual address
    /// # Errors
    ///
    /// Will return `Error::AddressFormat` for malformed or word addresses.
    pub fn write_bool(&self, address: &str, value: bool) -> Result<()> {
        let (arena, spec) = resolve_bit(address)?;
        self.memory.set_bit(arena, spec.start as usize, value)
    }

    /// Save all arenas to a snapshot file
    /// # Errors
    ///
    /// Will return `Error::Transport` if the file could not be written.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.memory.save(path).await
    }

    /// Restore all arenas from a snapshot file
    /// # Errors
    ///
    /// Will return `Error::Snapshot` if the file is not a complete snapshot.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        self.memory.load(path).await
    }
}

fn resolve(address: &str) -> Result<(ArenaId, AddressSpec)> {
    let spec = AddressSpec::parse(address, 1)?;
    Ok((ArenaId::resolve(spec.area, spec.db_number)?, spec))
}

fn resolve_bit(address: &str) -> Result<(ArenaId, AddressSpec)> {
    let (arena, spec) = resolve(address)?;
    if spec.area.is_word_area() {
        return Err(Error::address(address, "counters and timers have no bit access"));
    }
    Ok((arena, spec))
}

async fn handle_connection(
    dispatcher: &RequestDispatcher,
    mut stream: TcpStream,
    shutdown: &CancellationToken,
) {
    let mut state = ConnectionState::AwaitingHandshake1;
    loop {
        let frame = tokio::select! {
            frame = recv_frame(&mut stream) => frame,
            () = shutdown.cancelled() => return,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "receive failed");
                return;
            }
        };

        let (reply, close) = match dispatcher.handle(&mut state, &frame) {
            Outcome::Reply(reply) => (reply, false),
            Outcome::ReplyAndClose(reply) => (reply, true),
            Outcome::Close => return,
        };
        if let Err(err) = send_frame(&mut stream, &reply).await {
            warn!(%err, "send failed");
            return;
        }
        if close {
            return;
        }
    }
}
