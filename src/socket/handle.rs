//! The reference-counted socket handle.

use crate::io::IoTable;
use futures::FutureExt;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

thread_local! {
    static NEXT_SOCKET_ID: Cell<u64> = const { Cell::new(1) };
}

/// Tag identifying one attached protocol context.
///
/// Tags are plain integers so higher layers can mint their own without
/// coordinating through this crate; the pool reserves [`CtxTag::POOL`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CtxTag(pub u32);

impl CtxTag {
    /// Pool membership bookkeeping.
    pub const POOL: CtxTag = CtxTag(1);
    /// TLS/session state attached by a wrap hook.
    pub const WRAP: CtxTag = CtxTag(2);
}

/// Opaque per-socket record attached by a higher layer.
///
/// The socket keeps attached contexts in attachment order and runs each
/// one's `teardown` in that order when the last handle drops. Lookup goes
/// through `Any` downcasting, so implementors supply the two accessors.
pub trait ProtocolCtx: 'static {
    /// Runs exactly once, when the owning socket is destroyed.
    fn teardown(&mut self) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Result of the cheap liveness probe on an idle socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketHealth {
    /// Connected, no bytes waiting. Safe to hand out.
    Alive,
    /// Peer already sent FIN.
    Eof,
    /// Connected but bytes are waiting that nobody asked for — the
    /// connection is mid-protocol and unsafe to reuse.
    Dirty,
    /// The probe itself failed.
    Broken,
}

struct ProtoEntry {
    tag: CtxTag,
    ctx: Box<dyn ProtocolCtx>,
}

pub(crate) struct SocketInner {
    id: u64,
    table: IoTable,
    stream: Rc<TcpStream>,
    peer: SocketAddr,
    local: SocketAddr,
    last_activity: Cell<Instant>,
    contexts: RefCell<Vec<ProtoEntry>>,
    ctx_bound: Cell<bool>,
    wrapped: Cell<bool>,
}

/// One physical transport connection.
///
/// `Socket` is a cheap handle: clones share the connection, and the
/// connection is torn down when the last clone drops — attached protocol
/// contexts run their `teardown` in attachment order, then the transport
/// closes. The handle itself never issues backend calls after that point
/// because there is no handle left to call through.
#[derive(Clone)]
pub struct Socket {
    inner: Rc<SocketInner>,
}

impl Socket {
    pub(crate) fn from_stream(table: IoTable, stream: TcpStream) -> std::io::Result<Socket> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let id = NEXT_SOCKET_ID.with(|n| {
            let id = n.get();
            n.set(id + 1);
            id
        });
        tracing::debug!(id, %peer, "socket established");
        Ok(Socket {
            inner: Rc::new(SocketInner {
                id,
                table,
                stream: Rc::new(stream),
                peer,
                local,
                last_activity: Cell::new(Instant::now()),
                contexts: RefCell::new(Vec::new()),
                ctx_bound: Cell::new(false),
                wrapped: Cell::new(false),
            }),
        })
    }

    /// Monotonically increasing per-reactor id, for log correlation.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn table(&self) -> &IoTable {
        &self.inner.table
    }

    pub(crate) fn stream(&self) -> Rc<TcpStream> {
        Rc::clone(&self.inner.stream)
    }

    /// True when two handles refer to the same connection.
    pub fn same_socket(&self, other: &Socket) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stamps the last-activity clock; the I/O context calls this on
    /// every successful read or write.
    pub(crate) fn touch(&self) {
        self.inner.last_activity.set(Instant::now());
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.get().elapsed()
    }

    /// Non-consuming liveness probe: peeks one byte without removing it
    /// from the receive queue, classifying the socket without ever
    /// blocking or stealing protocol data.
    pub fn health(&self) -> SocketHealth {
        let mut probe = [0u8; 1];
        match self.inner.stream.peek(&mut probe).now_or_never() {
            None => SocketHealth::Alive,
            Some(Ok(0)) => SocketHealth::Eof,
            Some(Ok(_)) => SocketHealth::Dirty,
            Some(Err(_)) => SocketHealth::Broken,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.health(), SocketHealth::Alive)
    }

    /// Attaches a protocol context. Tags are not deduplicated; lookups
    /// find the first match in attachment order.
    pub fn attach_ctx(&self, tag: CtxTag, ctx: Box<dyn ProtocolCtx>) {
        self.inner.contexts.borrow_mut().push(ProtoEntry { tag, ctx });
    }

    /// Detaches the first context with `tag`, returning it without
    /// running its teardown (the caller now owns it).
    pub fn detach_ctx(&self, tag: CtxTag) -> Option<Box<dyn ProtocolCtx>> {
        let mut contexts = self.inner.contexts.borrow_mut();
        let idx = contexts.iter().position(|e| e.tag == tag)?;
        Some(contexts.remove(idx).ctx)
    }

    pub fn has_ctx(&self, tag: CtxTag) -> bool {
        self.inner.contexts.borrow().iter().any(|e| e.tag == tag)
    }

    /// Runs `f` against the first context with `tag`, downcast to `T`.
    /// Returns `None` when no context with the tag (and type) exists.
    pub fn with_ctx<T: ProtocolCtx, R>(&self, tag: CtxTag, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut contexts = self.inner.contexts.borrow_mut();
        let entry = contexts.iter_mut().find(|e| e.tag == tag)?;
        let ctx = entry.ctx.as_any_mut().downcast_mut::<T>()?;
        Some(f(ctx))
    }

    /// Marks this socket as carrying an active I/O context. At most one
    /// may be bound at a time; a second bind is a programming error.
    pub(crate) fn bind_context(&self) {
        assert!(
            !self.inner.ctx_bound.replace(true),
            "socket {} already has an active I/O context",
            self.inner.id
        );
    }

    pub(crate) fn unbind_context(&self) {
        self.inner.ctx_bound.set(false);
    }

    /// Fires the post-connect wrap hook at most once per socket.
    pub(crate) fn run_wrap_hook(&self, hook: &dyn Fn(&Socket)) {
        if !self.inner.wrapped.replace(true) {
            hook(self);
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("local", &self.inner.local)
            .finish_non_exhaustive()
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        for entry in self.contexts.get_mut().drain(..) {
            let mut ctx = entry.ctx;
            ctx.teardown();
        }
        tracing::debug!(id = self.id, peer = %self.peer, "socket destroyed");
    }
}
