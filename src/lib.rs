//! # kvnet
//!
//! The asynchronous socket and connection-pooling core of a key-value
//! database client.
//!
//! `kvnet` abstracts two asynchronous I/O execution models — readiness
//! notification ("event" style, where the caller owns the read/write loop)
//! and completion ("the runtime owns the buffers and calls you back") —
//! behind one capability table, manages the full lifecycle of a TCP
//! connection (resolve → connect → buffered read/write → close), and layers
//! a per-destination connection pool on top.
//!
//! ## Features
//!
//! - **Dual I/O models**: one [`io::IoTable`] interface over event-driven
//!   and completion-based scheduling
//! - **Cancellable connects**: [`socket::ConnectJob`] walks the resolved
//!   address list with a deadline timer; the callback fires exactly once
//! - **Buffered contexts**: [`socket::IoContext`] with "wake me at ≥ n
//!   bytes" reads, FIFO writes and a zero-copy flush path
//! - **Connection pooling**: [`socket::SocketPool`] with idle-expiry,
//!   borrow timeouts and per-destination caps
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kvnet::io::IoTable;
//! use kvnet::socket::SocketPool;
//! use std::time::Duration;
//!
//! kvnet::io::block_on(async {
//!     let pool = SocketPool::new(IoTable::event(), Default::default(), Default::default());
//!     let _req = pool.get("db.example.com:11210", Duration::from_secs(5), Box::new(|res| {
//!         match res {
//!             Ok(sock) => println!("connected to {}", sock.peer_addr()),
//!             Err(err) => eprintln!("no connection: {err}"),
//!         }
//!     }));
//! });
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error taxonomy and the segmented byte buffer
//! - [`config`] - Endpoints and plain-value tunables
//! - [`dns`] - Hostname resolution and address ordering
//! - [`io`] - The normalized I/O capability table and timers
//! - [`socket`] - Sockets, connect jobs, buffered contexts, the pool
//!
//! ## Threading
//!
//! The core is single-threaded by design: all state is reference-counted
//! without atomics and mutated only between I/O callbacks on one reactor
//! thread. Run one reactor (see [`io::block_on`]) per worker thread and
//! never share an [`io::IoTable`], [`socket::Socket`] or
//! [`socket::SocketPool`] across threads.

pub mod base;
pub mod config;
pub mod dns;
pub mod io;
pub mod socket;

pub use base::neterror::NetError;
pub use config::{Endpoint, IpPreference, NetConfig, PoolConfig};
