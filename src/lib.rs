#![warn(missing_docs)]
#![deny(
    missing_debug_implementations,
    rust_2018_idioms,
    single_use_lifetimes,
    unreachable_pub
)]

/*!
This crate talks to PLC devices of the Siemens S7 family over ISO-on-TCP and
ships a virtual S7 PLC that answers the same protocol from memory.

Addresses are given as text: `M100`, `M100.3`, `I0.1`, `Q4`, `DB5.20`,
`DB5.DBX20.1`, `V300` (the same as `DB1.300`), `T7` and `C3`.

# Examples
A connection with a PLC can either be opened via a standalone connection ([S7Client]) or with a connection pool ([S7Pool]).
Both implement the [Reader] and [Writer] traits.
## Connection via standalone connection
```rust, no_run
# tokio_test::block_on(async {
use std::net::Ipv4Addr;
use s7link::{Reader, S7Client, S7Types};

// create single s7 client
let client = S7Client::new(Ipv4Addr::new(127, 0, 0, 1), S7Types::S71200).await?;

// read some data
let data = client.read_bytes("DB100.0", 4).await?;
let speed: f32 = client.read_value("DB100.4").await?;
# Ok::<(), s7link::errors::Error>(())
# });
```

## Connection via a pooled connection
```rust, no_run
# tokio_test::block_on(async {
use std::net::Ipv4Addr;
use s7link::{S7Pool, S7Types, Writer};

// create connection pool
let pool = S7Pool::new(Ipv4Addr::new(127, 0, 0, 1), S7Types::S71200);

// write some data
pool.write_bool("M10.1", true).await?;
# Ok::<(), s7link::errors::Error>(())
# });
```

## Virtual PLC
```rust
# tokio_test::block_on(async {
use s7link::{ClientOptions, Reader, S7Client, S7Server, S7Types, ServerOptions, Writer};

let server = S7Server::new(ServerOptions::default());
let addr = server.bind("127.0.0.1:0".parse().unwrap()).await?;

let client = S7Client::with_options(addr, ClientOptions::new(S7Types::S71200)).await?;
client.write_bytes("DB1.0", &[1, 2, 3]).await?;
assert_eq!(server.read_bytes("DB1.0", 3)?, vec![1, 2, 3]);
assert_eq!(client.read_bytes("V0", 3).await?, vec![1, 2, 3]);

server.shutdown();
# Ok::<(), s7link::errors::Error>(())
# });
```
*/

mod client;
mod connection;
pub mod errors;
mod s7_protocol;
mod server;

pub use client::create::{ClientOptions, S7Client};
pub use client::pool::S7Pool;
pub use client::triggers::TriggerCollection;
pub use client::{Reader, Writer};
pub use connection::iso::{ConnectionType, S7Types};
pub use s7_protocol::address::AddressSpec;
pub use s7_protocol::codec;
pub use s7_protocol::types::{Area, MAX_ITEMS_PER_REQUEST};
pub use server::memory::{ArenaId, VirtualMemoryStore, ARENA_SIZE};
pub use server::{S7Server, ServerOptions};
