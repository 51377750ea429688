//! The buffered read/write layer bound to one socket.
//!
//! An [`IoContext`] turns the raw table primitives into protocol-friendly
//! semantics: "call me once at least `n` bytes are buffered", FIFO
//! buffered writes, and a zero-copy flush path. The two scheduling
//! algorithms — one per I/O model — live here and are selected once when
//! the context is bound; everything else is model-agnostic.

use crate::base::chunks::ChunkList;
use crate::base::neterror::NetError;
use crate::io::event::{EventIo, Watch};
use crate::io::{CompletionIo, IoTable, OpHandle, Timer};
use crate::socket::handle::Socket;
use bytes::{Bytes, BytesMut};
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::Duration;

/// Segment size for reads into the input buffer.
const READ_CHUNK: usize = 16 * 1024;

/// Callback invoked when the context is released: the socket and whether
/// it is clean enough (no in-flight I/O, no buffered output, no error) to
/// be returned to a pool.
pub type OnRelease = Box<dyn FnOnce(&Socket, bool)>;

/// User callbacks for one context.
///
/// `on_read` receives the total number of buffered bytes once the
/// requested threshold is met; walk them with [`IoContext::chunks`] and
/// drop what you have parsed with [`IoContext::consume`]. The threshold is
/// not persistent — re-issue [`IoContext::request_bytes`] before
/// returning, or the context goes quiet.
pub struct CtxProcs {
    pub on_read: Box<dyn FnMut(&IoContext, usize)>,
    pub on_error: Box<dyn FnMut(&IoContext, NetError)>,
    /// Zero-copy path: "you may write now" after [`IoContext::want_flush`].
    pub on_flush_ready: Option<Box<dyn FnMut(&IoContext)>>,
    /// Zero-copy path: bytes from [`IoContext::put_ready`] the transport
    /// has accepted so far. May report less than supplied; the rest is
    /// still queued.
    pub on_flush_done: Option<Box<dyn FnMut(&IoContext, usize)>>,
}

impl CtxProcs {
    pub fn new(
        on_read: impl FnMut(&IoContext, usize) + 'static,
        on_error: impl FnMut(&IoContext, NetError) + 'static,
    ) -> Self {
        CtxProcs {
            on_read: Box::new(on_read),
            on_error: Box::new(on_error),
            on_flush_ready: None,
            on_flush_done: None,
        }
    }
}

/// Output queue: FIFO segments, each flagged as copied (`enqueue_write`)
/// or caller-supplied (`put_ready`), so flush completion can be reported
/// for exactly the zero-copy bytes.
#[derive(Default)]
struct OutQueue {
    segs: std::collections::VecDeque<(Bytes, bool)>,
    len: usize,
}

impl OutQueue {
    fn push(&mut self, data: Bytes, flush: bool) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segs.push_back((data, flush));
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slices(&self) -> Vec<io::IoSlice<'_>> {
        self.segs.iter().map(|(b, _)| io::IoSlice::new(b)).collect()
    }

    fn bytes(&self) -> Vec<Bytes> {
        self.segs.iter().map(|(b, _)| b.clone()).collect()
    }

    /// Drops `n` accepted bytes from the front; returns how many of them
    /// were zero-copy (`put_ready`) bytes.
    fn consume(&mut self, n: usize) -> usize {
        use bytes::Buf;
        let mut remaining = n;
        let mut flushed = 0;
        while remaining > 0 {
            let Some((front, is_flush)) = self.segs.front_mut() else {
                break;
            };
            let take = front.len().min(remaining);
            if *is_flush {
                flushed += take;
            }
            if take == front.len() {
                self.segs.pop_front();
            } else {
                front.advance(take);
            }
            remaining -= take;
        }
        self.len -= n - remaining;
        flushed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CtxState {
    Active,
    Closed,
}

/// The two concrete schedulers, picked once at bind time from the
/// socket's table.
enum Engine {
    Event(Rc<EventIo>),
    Completion(Rc<CompletionIo>),
}

struct CtxShared {
    sock: Socket,
    engine: Engine,
    state: Cell<CtxState>,
    finalized: Cell<bool>,
    /// True while a user callback is running; `schedule` is a no-op then
    /// and the scheduler re-materializes intent itself afterwards.
    dispatching: Cell<bool>,
    wanted: Cell<usize>,
    wants_flush: Cell<bool>,
    input: RefCell<ChunkList>,
    output: RefCell<OutQueue>,
    error: Cell<Option<NetError>>,
    /// In-flight backend operations (completion model). The context is
    /// logically closed the moment `close` runs, but its memory and the
    /// release callback wait for this to reach zero.
    pending: Cell<u32>,
    rd_inflight: Cell<bool>,
    wr_inflight: Cell<bool>,
    rd_op: RefCell<Option<OpHandle>>,
    wr_op: RefCell<Option<OpHandle>>,
    watch: RefCell<Option<Watch>>,
    error_timer: Timer,
    flush_timer: Timer,
    wake_timer: Timer,
    procs: RefCell<CtxProcs>,
    on_release: RefCell<Option<OnRelease>>,
}

/// Buffered I/O bound to one [`Socket`].
///
/// The context holds a strong reference to its socket for its entire
/// life, and a socket carries at most one active context at a time.
/// All intent (requested bytes, queued writes) is materialized into
/// backend calls by [`schedule`], which the consumer calls once per
/// reactor turn after changing anything.
///
/// [`schedule`]: IoContext::schedule
#[derive(Clone)]
pub struct IoContext {
    shared: Rc<CtxShared>,
}

impl IoContext {
    /// Binds a context to `sock`. Panics if the socket already has one.
    pub fn bind(sock: Socket, procs: CtxProcs) -> IoContext {
        sock.bind_context();
        let engine = match sock.table() {
            IoTable::Event(ev) => Engine::Event(Rc::clone(ev)),
            IoTable::Completion(cio) => Engine::Completion(Rc::clone(cio)),
        };
        tracing::trace!(socket = sock.id(), "context bound");
        IoContext {
            shared: Rc::new(CtxShared {
                sock,
                engine,
                state: Cell::new(CtxState::Active),
                finalized: Cell::new(false),
                dispatching: Cell::new(false),
                wanted: Cell::new(0),
                wants_flush: Cell::new(false),
                input: RefCell::new(ChunkList::new()),
                output: RefCell::new(OutQueue::default()),
                error: Cell::new(None),
                pending: Cell::new(0),
                rd_inflight: Cell::new(false),
                wr_inflight: Cell::new(false),
                rd_op: RefCell::new(None),
                wr_op: RefCell::new(None),
                watch: RefCell::new(None),
                error_timer: Timer::new(),
                flush_timer: Timer::new(),
                wake_timer: Timer::new(),
                procs: RefCell::new(procs),
                on_release: RefCell::new(None),
            }),
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.shared.sock
    }

    /// Requires at least `n` total buffered bytes before the next
    /// `on_read`. The threshold is absolute, not incremental, and is
    /// cleared every time `on_read` fires.
    pub fn request_bytes(&self, n: usize) {
        self.shared.wanted.set(n);
    }

    /// Copies `data` onto the output queue. Transmission order is FIFO
    /// across all queued writes.
    pub fn enqueue_write(&self, data: &[u8]) {
        self.shared
            .output
            .borrow_mut()
            .push(Bytes::copy_from_slice(data), false);
    }

    /// Asks for an `on_flush_ready` callback when the transport can
    /// accept writes. Like `request_bytes`, one-shot: re-arm after every
    /// callback.
    pub fn want_flush(&self) {
        self.shared.wants_flush.set(true);
    }

    /// Queues caller-owned buffers without copying. Acceptance is
    /// reported through `on_flush_done` and may lag or fall short; the
    /// unaccepted tail stays queued.
    pub fn put_ready(&self, bufs: Vec<Bytes>) {
        let mut output = self.shared.output.borrow_mut();
        for buf in bufs {
            output.push(buf, true);
        }
    }

    /// Total bytes currently buffered for reading.
    pub fn available(&self) -> usize {
        self.shared.input.borrow().len()
    }

    /// The buffered input as a finite sequence of contiguous chunks
    /// (cheap reference-counted clones, front to back). Reading does not
    /// consume; call [`consume`](IoContext::consume) for that.
    pub fn chunks(&self) -> Vec<Bytes> {
        self.shared.input.borrow().to_bytes_vec()
    }

    /// Discards `n` parsed bytes from the front of the input buffer.
    pub fn consume(&self, n: usize) {
        self.shared.input.borrow_mut().consume(n);
    }

    /// The sticky error, if any I/O failure has been recorded.
    pub fn error(&self) -> Option<NetError> {
        self.shared.error.get()
    }

    /// Materializes current intent into backend calls. Call once per
    /// reactor turn after `request_bytes` / `enqueue_write` /
    /// `want_flush` / `put_ready`. No-op while an error is pending, while
    /// a user callback is running (the scheduler re-arms itself when it
    /// returns), or after `close`.
    pub fn schedule(&self) {
        CtxShared::schedule(&self.shared);
    }

    /// Takes the context out of active use. In-flight completion
    /// operations are cancelled the way a completion runtime cancels on
    /// handle close; once none remain, `on_release` fires with whether
    /// the socket is clean enough to pool (no in-flight I/O, no buffered
    /// output, no recorded error). The caller must not touch the context
    /// after this.
    pub fn close(&self, on_release: Option<OnRelease>) {
        let shared = &self.shared;
        if shared.state.get() == CtxState::Closed {
            return;
        }
        tracing::trace!(socket = shared.sock.id(), "context closing");
        shared.state.set(CtxState::Closed);
        *shared.on_release.borrow_mut() = on_release;
        shared.watch.borrow_mut().take();
        shared.error_timer.cancel();
        shared.flush_timer.cancel();
        shared.wake_timer.cancel();

        // Abort outstanding completion ops; each abort retires one
        // pending count, same as a completed operation would.
        if shared.rd_op.borrow_mut().take().is_some() && shared.rd_inflight.replace(false) {
            CtxShared::retire_pending(shared);
        }
        if shared.wr_op.borrow_mut().take().is_some() && shared.wr_inflight.replace(false) {
            CtxShared::retire_pending(shared);
        }
        CtxShared::maybe_finalize(shared);
    }
}

impl CtxShared {
    fn schedule(shared: &Rc<CtxShared>) {
        if shared.error.get().is_some()
            || shared.dispatching.get()
            || shared.state.get() != CtxState::Active
        {
            return;
        }
        // A threshold already met by leftover input never reaches the
        // backend; deliver it on the next turn instead of waiting for
        // bytes that may not come.
        let wanted = shared.wanted.get();
        if wanted > 0 && shared.input.borrow().len() >= wanted {
            let rc = Rc::clone(shared);
            shared.wake_timer.schedule(Duration::ZERO, move || {
                if rc.state.get() != CtxState::Active || rc.error.get().is_some() {
                    return;
                }
                CtxShared::maybe_dispatch_read(&rc);
                CtxShared::schedule(&rc);
            });
        }
        match &shared.engine {
            Engine::Event(ev) => CtxShared::event_schedule(shared, ev),
            Engine::Completion(cio) => CtxShared::completion_schedule(shared, cio),
        }
    }

    // ---- event scheduler -------------------------------------------------
    //
    // One readiness watch, armed from current intent. The ready handler
    // performs the non-blocking read/write loops itself, dispatches, and
    // re-arms.

    fn event_schedule(shared: &Rc<CtxShared>, ev: &Rc<EventIo>) {
        use tokio::io::Interest;

        let wanted = shared.wanted.get();
        let want_read = wanted > 0 && shared.input.borrow().len() < wanted;
        let want_write = !shared.output.borrow().is_empty() || shared.wants_flush.get();

        let interest = match (want_read, want_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => {
                shared.watch.borrow_mut().take();
                return;
            }
        };

        let rc = Rc::clone(shared);
        let watch = ev.watch(
            shared.sock.stream(),
            interest,
            Box::new(move |ready| {
                CtxShared::event_ready(&rc, ready);
            }),
        );
        *shared.watch.borrow_mut() = Some(watch);
    }

    fn event_ready(shared: &Rc<CtxShared>, ready: io::Result<tokio::io::Ready>) {
        shared.watch.borrow_mut().take();
        if shared.state.get() != CtxState::Active || shared.error.get().is_some() {
            return;
        }
        let ready = match ready {
            Ok(r) => r,
            Err(e) => {
                CtxShared::fail(shared, NetError::from_io(&e));
                return;
            }
        };

        if ready.is_readable() || ready.is_read_closed() {
            CtxShared::event_fill_input(shared);
            if shared.state.get() != CtxState::Active || shared.error.get().is_some() {
                return;
            }
        }
        if ready.is_writable() || ready.is_write_closed() {
            if shared.wants_flush.get() {
                shared.wants_flush.set(false);
                CtxShared::dispatch_flush_ready(shared);
                if shared.state.get() != CtxState::Active || shared.error.get().is_some() {
                    return;
                }
            }
            CtxShared::event_drain_output(shared);
            if shared.state.get() != CtxState::Active || shared.error.get().is_some() {
                return;
            }
        }
        CtxShared::schedule(shared);
    }

    /// Reads until would-block, then dispatches if the threshold is met.
    /// EOF delivers any satisfied read first, then the shutdown error.
    fn event_fill_input(shared: &Rc<CtxShared>) {
        let stream = shared.sock.stream();
        let mut eof = false;
        loop {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            match stream.try_read_buf(&mut buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => {
                    shared.sock.touch();
                    shared.input.borrow_mut().push(buf.freeze());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    CtxShared::fail(shared, NetError::from_io(&e));
                    return;
                }
            }
        }
        CtxShared::maybe_dispatch_read(shared);
        if eof {
            CtxShared::fail(shared, NetError::RemoteClosed);
        }
    }

    /// Writes until would-block or the queue empties.
    fn event_drain_output(shared: &Rc<CtxShared>) {
        let stream = shared.sock.stream();
        let mut flushed_total = 0;
        loop {
            let res = {
                let output = shared.output.borrow();
                if output.is_empty() {
                    break;
                }
                let slices = output.slices();
                stream.try_write_vectored(&slices)
            };
            match res {
                Ok(0) => {
                    CtxShared::fail(shared, NetError::Io { errno: None });
                    return;
                }
                Ok(n) => {
                    shared.sock.touch();
                    flushed_total += shared.output.borrow_mut().consume(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    CtxShared::fail(shared, NetError::from_io(&e));
                    return;
                }
            }
        }
        if flushed_total > 0 {
            CtxShared::dispatch_flush_done(shared, flushed_total);
        }
    }

    // ---- completion scheduler --------------------------------------------
    //
    // At most one outstanding read and one outstanding write. Completions
    // decide whether to dispatch and resubmit exactly one follow-up.

    fn completion_schedule(shared: &Rc<CtxShared>, cio: &Rc<CompletionIo>) {
        if shared.wanted.get() > 0
            && !shared.rd_inflight.get()
            && shared.input.borrow().len() < shared.wanted.get()
        {
            shared.rd_inflight.set(true);
            shared.pending.set(shared.pending.get() + 1);
            let rc = Rc::clone(shared);
            let op = cio.start_read(
                shared.sock.stream(),
                BytesMut::with_capacity(READ_CHUNK),
                Box::new(move |res, buf| {
                    CtxShared::completion_read_done(&rc, res, buf);
                }),
            );
            *shared.rd_op.borrow_mut() = Some(op);
        }

        if shared.wants_flush.get() && !shared.wr_inflight.get() {
            shared.wants_flush.set(false);
            let rc = Rc::clone(shared);
            shared.flush_timer.schedule(Duration::ZERO, move || {
                if rc.state.get() != CtxState::Active || rc.error.get().is_some() {
                    return;
                }
                CtxShared::dispatch_flush_ready(&rc);
                CtxShared::schedule(&rc);
            });
        }

        if !shared.output.borrow().is_empty() && !shared.wr_inflight.get() {
            shared.wr_inflight.set(true);
            shared.pending.set(shared.pending.get() + 1);
            let bufs = shared.output.borrow().bytes();
            let rc = Rc::clone(shared);
            let op = cio.start_write(
                shared.sock.stream(),
                bufs,
                Box::new(move |res| {
                    CtxShared::completion_write_done(&rc, res);
                }),
            );
            *shared.wr_op.borrow_mut() = Some(op);
        }
    }

    fn completion_read_done(shared: &Rc<CtxShared>, res: io::Result<usize>, buf: BytesMut) {
        if let Some(op) = shared.rd_op.borrow_mut().take() {
            op.disarm();
        }
        shared.rd_inflight.set(false);
        CtxShared::retire_pending(shared);
        if shared.state.get() != CtxState::Active || shared.error.get().is_some() {
            return;
        }
        match res {
            Ok(0) => {
                CtxShared::maybe_dispatch_read(shared);
                CtxShared::fail(shared, NetError::RemoteClosed);
            }
            Ok(_) => {
                shared.sock.touch();
                shared.input.borrow_mut().push(buf.freeze());
                CtxShared::maybe_dispatch_read(shared);
                CtxShared::schedule(shared);
            }
            Err(e) => {
                CtxShared::fail(shared, NetError::from_io(&e));
            }
        }
    }

    fn completion_write_done(shared: &Rc<CtxShared>, res: io::Result<usize>) {
        if let Some(op) = shared.wr_op.borrow_mut().take() {
            op.disarm();
        }
        shared.wr_inflight.set(false);
        CtxShared::retire_pending(shared);
        if shared.state.get() == CtxState::Closed {
            // consume anyway so the release verdict sees honest numbers
            if let Ok(n) = res {
                shared.output.borrow_mut().consume(n);
            }
            CtxShared::maybe_finalize(shared);
            return;
        }
        if shared.error.get().is_some() {
            return;
        }
        match res {
            Ok(n) => {
                shared.sock.touch();
                let flushed = shared.output.borrow_mut().consume(n);
                if flushed > 0 {
                    CtxShared::dispatch_flush_done(shared, flushed);
                }
                // Still-buffered output triggers exactly one more request.
                CtxShared::schedule(shared);
            }
            Err(e) => {
                CtxShared::fail(shared, NetError::from_io(&e));
            }
        }
    }

    // ---- shared plumbing -------------------------------------------------

    fn maybe_dispatch_read(shared: &Rc<CtxShared>) {
        let wanted = shared.wanted.get();
        if wanted == 0 || shared.input.borrow().len() < wanted {
            return;
        }
        let total = shared.input.borrow().len();
        shared.wanted.set(0);
        let ctx = IoContext { shared: Rc::clone(shared) };
        shared.dispatching.set(true);
        (shared.procs.borrow_mut().on_read)(&ctx, total);
        shared.dispatching.set(false);
    }

    fn dispatch_flush_ready(shared: &Rc<CtxShared>) {
        let has_cb = shared.procs.borrow().on_flush_ready.is_some();
        if !has_cb {
            return;
        }
        let ctx = IoContext { shared: Rc::clone(shared) };
        shared.dispatching.set(true);
        if let Some(cb) = shared.procs.borrow_mut().on_flush_ready.as_mut() {
            cb(&ctx);
        }
        shared.dispatching.set(false);
    }

    fn dispatch_flush_done(shared: &Rc<CtxShared>, nbytes: usize) {
        let has_cb = shared.procs.borrow().on_flush_done.is_some();
        if !has_cb {
            return;
        }
        let ctx = IoContext { shared: Rc::clone(shared) };
        shared.dispatching.set(true);
        if let Some(cb) = shared.procs.borrow_mut().on_flush_done.as_mut() {
            cb(&ctx, nbytes);
        }
        shared.dispatching.set(false);
    }

    /// Records the first error and arranges asynchronous delivery.
    /// Later errors lose; scheduling stops immediately.
    fn fail(shared: &Rc<CtxShared>, err: NetError) {
        if shared.error.get().is_some() {
            return;
        }
        tracing::debug!(socket = shared.sock.id(), error = %err, "context error");
        shared.error.set(Some(err));
        shared.watch.borrow_mut().take();

        // Never synchronously: the consumer must not re-enter its own
        // call stack, so delivery rides the timer mechanism.
        let rc = Rc::clone(shared);
        shared.error_timer.schedule(Duration::ZERO, move || {
            if rc.state.get() != CtxState::Active {
                return;
            }
            let ctx = IoContext { shared: Rc::clone(&rc) };
            rc.dispatching.set(true);
            (rc.procs.borrow_mut().on_error)(&ctx, err);
            rc.dispatching.set(false);
        });
    }

    fn retire_pending(shared: &Rc<CtxShared>) {
        shared.pending.set(shared.pending.get().saturating_sub(1));
        CtxShared::maybe_finalize(shared);
    }

    /// The check-and-release run after every operation that retires a
    /// pending count: once the context is closed and nothing is in
    /// flight, unbind the socket and deliver the release verdict.
    fn maybe_finalize(shared: &Rc<CtxShared>) {
        if shared.state.get() != CtxState::Closed
            || shared.pending.get() != 0
            || shared.finalized.replace(true)
        {
            return;
        }
        let reusable = shared.output.borrow().is_empty() && shared.error.get().is_none();
        tracing::trace!(socket = shared.sock.id(), reusable, "context released");
        shared.sock.unbind_context();
        if let Some(cb) = shared.on_release.borrow_mut().take() {
            cb(&shared.sock, reusable);
        }
    }
}
