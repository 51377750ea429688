//! Sockets, connect jobs, buffered contexts and the pool.
//!
//! - [`handle`]: the reference-counted [`Socket`] and its protocol-context
//!   registry
//! - [`connectjob`]: resolve → connect state machine with deadline
//! - [`context`]: the buffered read/write layer bound to one socket
//! - [`pool`]: per-destination caching of idle sockets

pub mod connectjob;
pub mod context;
pub mod handle;
pub mod pool;

pub use connectjob::{connect_to_any, ConnectCallback, ConnectJob, ConnectOptions};
pub use context::{CtxProcs, IoContext, OnRelease};
pub use handle::{CtxTag, ProtocolCtx, Socket, SocketHealth};
pub use pool::{GetCallback, PoolRequest, SocketPool};
