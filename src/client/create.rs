use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::iso::{dest_tsap, ConnectionType, S7Types, DEFAULT_LOCAL_TSAP, MIN_PDU_LENGTH};
use crate::connection::tcp::{connect, disconnect, exchange_buffer};
use crate::connection::Exchange;
use crate::errors::{Error, Result};

// Default TCP Port
pub(crate) const TCP_PORT: u16 = 102;
// Default TCP timeout
pub(crate) const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);
// Default timeout of one request/response exchange
pub(crate) const DATA_SEND_AND_RECEIVE_TIMEOUT: Duration = Duration::from_secs(4);

/// Connection parameters of a client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Device family, selects the handshake templates
    pub s7_type: S7Types,
    /// Rack of the CPU
    pub rack: u8,
    /// Slot of the CPU
    pub slot: u8,
    /// Connection type announced in the destination TSAP
    pub connection_type: ConnectionType,
    /// Local TSAP
    pub local_tsap: u16,
    /// Destination TSAP, overrides the one derived from rack and slot
    pub remote_tsap: Option<u16>,
    /// Timeout of the TCP connect and of the handshake
    pub connect_timeout: Duration,
    /// Timeout of every request/response exchange, `None` waits forever
    pub exchange_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new(S7Types::S71200)
    }
}

impl ClientOptions {
    /// Defaults for a device family, with the rack and slot of its usual CPU position
    pub fn new(s7_type: S7Types) -> Self {
        let (rack, slot) = s7_type.default_rack_slot();
        Self {
            s7_type,
            rack,
            slot,
            connection_type: ConnectionType::default(),
            local_tsap: DEFAULT_LOCAL_TSAP,
            remote_tsap: None,
            connect_timeout: CONNECTION_TIMEOUT,
            exchange_timeout: Some(DATA_SEND_AND_RECEIVE_TIMEOUT),
        }
    }

    /// Set rack and slot of the CPU
    #[must_use]
    pub fn rack_slot(mut self, rack: u8, slot: u8) -> Self {
        self.rack = rack;
        self.slot = slot;
        self
    }

    /// Set the connection type
    #[must_use]
    pub fn connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    /// Set local and destination TSAP explicitly
    #[must_use]
    pub fn tsap(mut self, local_tsap: u16, remote_tsap: u16) -> Self {
        self.local_tsap = local_tsap;
        self.remote_tsap = Some(remote_tsap);
        self
    }

    /// Set the connect timeout
    #[must_use]
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the exchange timeout
    #[must_use]
    pub fn exchange_timeout(mut self, exchange_timeout: Option<Duration>) -> Self {
        self.exchange_timeout = exchange_timeout;
        self
    }

    pub(crate) fn dest_tsap(&self) -> u16 {
        self.remote_tsap
            .unwrap_or_else(|| dest_tsap(self.connection_type, self.rack, self.slot))
    }
}

/// Open ISO connection and the parameters negotiated on it
#[derive(Debug)]
pub(crate) struct Session {
    stream: Option<TcpStream>,
    pdu_length: u16,
    pdu_ref: u16,
    exchange_timeout: Option<Duration>,
}

impl Session {
    fn close(&mut self) {
        // dropping the stream closes the socket
        self.stream = None;
    }
}

#[async_trait]
impl Exchange for Session {
    fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn next_pdu_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn exchange(&mut self, request: BytesMut) -> Result<BytesMut> {
        let wait = self.exchange_timeout;
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        exchange_buffer(stream, &request, wait).await
    }
}

fn closed() -> Error {
    Error::Connection("Connection is closed".to_string())
}

/// Standalone S7 connection
///
/// Clones share the same session, requests of all clones are serialised.
#[derive(Debug, Clone)]
pub struct S7Client {
    addr: SocketAddr,
    options: ClientOptions,
    session: Arc<Mutex<Session>>,
    closed: Arc<AtomicBool>,
}

impl S7Client {
    /// Create new standalone connection to an S7 PLC on port 102
    ///```rust, no_run
    /// # tokio_test::block_on(async {
    /// use std::net::Ipv4Addr;
    /// use s7link::{S7Client, S7Types};
    ///
    /// // create single s7 client
    /// let client = S7Client::new(Ipv4Addr::new(192, 168, 10, 72), S7Types::S71200)
    ///          .await?;
    /// # Ok::<(), s7link::errors::Error>(())
    /// # });
    /// ```
    /// # Errors
    ///
    /// Will return `Error` if no connection could be established to the PLC.
    pub async fn new(ip: Ipv4Addr, s7_type: S7Types) -> Result<Self> {
        Self::with_options(SocketAddr::from((ip, TCP_PORT)), ClientOptions::new(s7_type)).await
    }

    /// Create new standalone connection with explicit connection parameters
    /// # Errors
    ///
    /// Will return `Error` if no connection could be established to the PLC.
    pub async fn with_options(addr: SocketAddr, options: ClientOptions) -> Result<Self> {
        let client = Self {
            addr,
            session: Arc::new(Mutex::new(Session {
                stream: None,
                pdu_length: MIN_PDU_LENGTH,
                pdu_ref: 0,
                exchange_timeout: options.exchange_timeout,
            })),
            options,
            closed: Arc::new(AtomicBool::new(true)),
        };
        client.connect().await?;

        Ok(client)
    }

    /// (Re)open the connection and negotiate the connection parameters.
    ///
    /// An open session is dropped first.
    /// # Errors
    ///
    /// Will return `Error` if no connection could be established to the PLC.
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.close(&mut session);

        let mut stream = match timeout(self.options.connect_timeout, TcpStream::connect(self.addr)).await
        {
            Ok(stream) => stream,
            Err(_) => {
                return Err(Error::Connection(format!(
                    "Error on connecting to '{}': Timed out after {} ms",
                    self.addr,
                    self.options.connect_timeout.as_millis()
                )))
            }
        }
        .map_err(|err| Error::Connection(format!("Error on connecting to '{}': {err}", self.addr)))?;

        let pdu_length = connect(&mut stream, &self.options).await?;
        info!(addr = %self.addr, pdu_length, "connected to PLC");

        session.stream = Some(stream);
        session.pdu_length = pdu_length;
        session.pdu_ref = 0;
        self.closed.store(false, Ordering::SeqCst);

        Ok(())
    }

    /// Gracefully disconnect from the PLC
    ///
    /// The session is closed even if the PLC does not confirm.
    /// # Errors
    ///
    /// Will return `Error` if the connection to the PLC could not be closed gracefully.
    pub async fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let wait = self.options.exchange_timeout;
        let result = match session.stream.as_mut() {
            Some(stream) => disconnect(stream, wait).await,
            None => Ok(()),
        };
        self.close(&mut session);
        result
    }

    /// Whether the session is closed, after `disconnect` or a broken exchange
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// PDU length negotiated for the current session
    pub async fn pdu_length(&self) -> u16 {
        self.session.lock().await.pdu_length
    }

    /// Connection parameters of this client
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Acquire the session for one operation, giving up when `cancel` fires first
    pub(crate) async fn lock(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, Session>> {
        let session = tokio::select! {
            session = self.session.lock() => session,
            () = cancel.cancelled() => return Err(Error::Cancelled),
        };
        if session.stream.is_none() {
            return Err(closed());
        }
        Ok(session)
    }

    /// Close the session when `result` leaves the stream in an unknown state
    pub(crate) fn settle<T>(&self, session: &mut Session, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.breaks_session() {
                warn!(addr = %self.addr, %err, "closing session");
                self.close(session);
            }
        }
        result
    }

    fn close(&self, session: &mut Session) {
        session.close();
        self.closed.store(true, Ordering::SeqCst);
    }
}
