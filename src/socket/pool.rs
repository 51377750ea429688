//! Per-destination connection pooling.
//!
//! Each `host:port` destination owns a bucket: a LIFO list of idle sockets
//! (each with an idle-expiry timer), the connect jobs currently in flight,
//! and a FIFO of borrow requests waiting for a socket. A socket is either
//! in the idle list or leased to exactly one caller, never both; idle +
//! connecting + leased never exceeds the configured total.

use crate::base::neterror::NetError;
use crate::config::{Endpoint, NetConfig, PoolConfig};
use crate::dns::{GaiResolver, Resolve};
use crate::io::{IoTable, Timer};
use crate::socket::connectjob::{ConnectJob, ConnectOptions};
use crate::socket::handle::{CtxTag, ProtocolCtx, Socket};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Borrow-request callback: a leased socket, or why none materialized.
pub type GetCallback = Box<dyn FnOnce(Result<Socket, NetError>)>;

/// Pool bookkeeping attached to every pooled socket, so `put` and
/// `discard` can find their way back to the right bucket and the
/// one-owner rule can be enforced.
struct PoolMember {
    key: String,
    leased: Cell<bool>,
}

impl ProtocolCtx for PoolMember {
    fn teardown(&mut self) {
        tracing::trace!(endpoint = %self.key, "pooled socket torn down");
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReqPhase {
    /// Queued; the borrow timer is live.
    Waiting,
    /// Matched with a socket; delivery is queued for the next turn.
    Assigned,
    /// Callback fired (or suppressed by cancel).
    Done,
}

struct BorrowReq {
    id: u64,
    bucket: Weak<Bucket>,
    phase: Cell<ReqPhase>,
    /// Borrow timeout while waiting, repurposed as the delivery signal
    /// once assigned.
    timer: Timer,
    sock: RefCell<Option<Socket>>,
    callback: RefCell<Option<GetCallback>>,
}

impl BorrowReq {
    fn deliver(req: &Rc<BorrowReq>) {
        if req.phase.get() != ReqPhase::Assigned {
            return;
        }
        req.phase.set(ReqPhase::Done);
        let sock = req.sock.borrow_mut().take().expect("assigned request carries a socket");
        if let Some(cb) = req.callback.borrow_mut().take() {
            cb(Ok(sock));
        }
    }

    fn timed_out(req: &Rc<BorrowReq>) {
        if req.phase.get() != ReqPhase::Waiting {
            return;
        }
        req.phase.set(ReqPhase::Done);
        if let Some(bucket) = req.bucket.upgrade() {
            bucket.waiters.borrow_mut().retain(|w| w.id != req.id);
            tracing::debug!(endpoint = %bucket.key, "borrow request timed out");
        }
        if let Some(cb) = req.callback.borrow_mut().take() {
            cb(Err(NetError::BorrowTimeout));
        }
    }
}

struct IdleEntry {
    sock: Socket,
    timer: Timer,
}

struct Bucket {
    key: String,
    endpoint: Endpoint,
    pool: Weak<PoolShared>,
    idle: RefCell<Vec<IdleEntry>>,
    jobs: RefCell<Vec<(u64, ConnectJob)>>,
    waiters: RefCell<VecDeque<Rc<BorrowReq>>>,
    leased: Cell<usize>,
}

impl Bucket {
    fn total(&self) -> usize {
        self.idle.borrow().len() + self.jobs.borrow().len() + self.leased.get()
    }

    /// Marks the socket leased and queues delivery for the next turn.
    fn assign(bucket: &Rc<Bucket>, req: &Rc<BorrowReq>, sock: Socket) {
        req.timer.cancel();
        req.phase.set(ReqPhase::Assigned);
        sock.with_ctx::<PoolMember, _>(CtxTag::POOL, |m| m.leased.set(true));
        bucket.leased.set(bucket.leased.get() + 1);
        tracing::trace!(endpoint = %bucket.key, socket = sock.id(), "socket assigned");
        *req.sock.borrow_mut() = Some(sock);
        let rc = Rc::clone(req);
        req.timer.schedule(Duration::ZERO, move || {
            BorrowReq::deliver(&rc);
        });
    }

    /// Starts one more connect job iff there are more queued requests
    /// than jobs already running and the total cap has room.
    fn maybe_connect(bucket: &Rc<Bucket>) {
        let Some(pool) = bucket.pool.upgrade() else {
            return;
        };
        if pool.closed.get() {
            return;
        }
        let jobs = bucket.jobs.borrow().len();
        let waiters = bucket.waiters.borrow().len();
        if jobs >= waiters || bucket.total() >= pool.cfg.max_total {
            return;
        }
        let job_id = pool.fresh_id();
        tracing::debug!(endpoint = %bucket.key, jobs = jobs + 1, "starting pooled connect");
        let b = Rc::clone(bucket);
        let job = ConnectJob::start(
            pool.table.clone(),
            Rc::clone(&pool.resolver),
            bucket.endpoint.clone(),
            ConnectOptions::from(&pool.net),
            Box::new(move |res| {
                Bucket::connect_done(&b, job_id, res);
            }),
        );
        bucket.jobs.borrow_mut().push((job_id, job));
    }

    fn connect_done(bucket: &Rc<Bucket>, job_id: u64, res: Result<Socket, NetError>) {
        bucket.jobs.borrow_mut().retain(|(id, _)| *id != job_id);
        let Some(pool) = bucket.pool.upgrade() else {
            return;
        };
        match res {
            Ok(sock) => {
                if pool.closed.get() {
                    return;
                }
                sock.attach_ctx(
                    CtxTag::POOL,
                    Box::new(PoolMember {
                        key: bucket.key.clone(),
                        leased: Cell::new(false),
                    }),
                );
                Bucket::hand_over(bucket, &pool, sock);
            }
            Err(err) => {
                // One failed connect fails every queued request for this
                // destination; retrying is the caller's decision.
                let drained: Vec<_> = bucket.waiters.borrow_mut().drain(..).collect();
                if !drained.is_empty() {
                    tracing::debug!(
                        endpoint = %bucket.key,
                        error = %err,
                        waiters = drained.len(),
                        "connect failed, failing all waiters"
                    );
                }
                for w in drained {
                    w.timer.cancel();
                    w.phase.set(ReqPhase::Done);
                    if let Some(cb) = w.callback.borrow_mut().take() {
                        cb(Err(err));
                    }
                }
            }
        }
    }

    /// Routes a free socket: the oldest waiter if any, else the idle
    /// list, else closed.
    fn hand_over(bucket: &Rc<Bucket>, pool: &Rc<PoolShared>, sock: Socket) {
        let waiter = bucket.waiters.borrow_mut().pop_front();
        match waiter {
            Some(req) => Bucket::assign(bucket, &req, sock),
            None => Bucket::park_idle(bucket, pool, sock),
        }
    }

    fn park_idle(bucket: &Rc<Bucket>, pool: &Rc<PoolShared>, sock: Socket) {
        if bucket.idle.borrow().len() >= pool.cfg.max_idle || !sock.is_alive() {
            tracing::debug!(endpoint = %bucket.key, socket = sock.id(), "closing surplus socket");
            Bucket::forget(&sock);
            return;
        }
        let timer = Timer::new();
        let sock_id = sock.id();
        let b = Rc::clone(bucket);
        timer.schedule(pool.cfg.idle_timeout, move || {
            let entry = {
                let mut idle = b.idle.borrow_mut();
                idle.iter()
                    .position(|e| e.sock.id() == sock_id)
                    .map(|pos| idle.remove(pos))
            };
            if let Some(entry) = entry {
                tracing::debug!(endpoint = %b.key, socket = sock_id, "idle socket expired");
                Bucket::forget(&entry.sock);
            }
        });
        tracing::trace!(endpoint = %bucket.key, socket = sock_id, "socket parked idle");
        bucket.idle.borrow_mut().push(IdleEntry { sock, timer });
    }

    /// Returns a leased socket to the bucket, serving a waiter directly
    /// when one is queued.
    fn release(bucket: &Rc<Bucket>, sock: Socket) {
        sock.with_ctx::<PoolMember, _>(CtxTag::POOL, |m| m.leased.set(false));
        bucket.leased.set(bucket.leased.get().saturating_sub(1));
        let Some(pool) = bucket.pool.upgrade() else {
            Bucket::forget(&sock);
            return;
        };
        if pool.closed.get() {
            Bucket::forget(&sock);
            return;
        }
        Bucket::hand_over(bucket, &pool, sock);
    }

    /// Erases pool bookkeeping from a socket the pool no longer tracks.
    fn forget(sock: &Socket) {
        sock.detach_ctx(CtxTag::POOL);
    }
}

struct PoolShared {
    table: IoTable,
    resolver: Rc<dyn Resolve>,
    net: NetConfig,
    cfg: PoolConfig,
    buckets: RefCell<HashMap<String, Rc<Bucket>>>,
    closed: Cell<bool>,
    next_id: Cell<u64>,
}

impl PoolShared {
    fn fresh_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }
}

/// Cancellable handle for one borrow request.
///
/// Dropping the handle does not cancel the request — the callback will
/// still fire. Call [`cancel`](PoolRequest::cancel) to suppress it: a
/// waiting request is dequeued, an assigned-but-undelivered one returns
/// its socket to the pool.
pub struct PoolRequest {
    req: Rc<BorrowReq>,
}

impl PoolRequest {
    pub fn cancel(&self) {
        match self.req.phase.get() {
            ReqPhase::Waiting => {
                self.req.phase.set(ReqPhase::Done);
                self.req.timer.cancel();
                self.req.callback.borrow_mut().take();
                if let Some(bucket) = self.req.bucket.upgrade() {
                    bucket.waiters.borrow_mut().retain(|w| w.id != self.req.id);
                    tracing::trace!(endpoint = %bucket.key, "waiting request cancelled");
                }
            }
            ReqPhase::Assigned => {
                self.req.phase.set(ReqPhase::Done);
                self.req.timer.cancel();
                self.req.callback.borrow_mut().take();
                let sock = self.req.sock.borrow_mut().take();
                if let (Some(bucket), Some(sock)) = (self.req.bucket.upgrade(), sock) {
                    tracing::trace!(endpoint = %bucket.key, socket = sock.id(), "assigned request cancelled");
                    Bucket::release(&bucket, sock);
                }
            }
            ReqPhase::Done => {}
        }
    }

    pub fn is_done(&self) -> bool {
        self.req.phase.get() == ReqPhase::Done
    }
}

/// The per-destination connection pool.
///
/// Single-threaded like everything else here: one pool per reactor, all
/// callbacks on the reactor thread.
pub struct SocketPool {
    shared: Rc<PoolShared>,
}

impl SocketPool {
    /// Pool resolving through the system resolver.
    pub fn new(table: IoTable, net: NetConfig, cfg: PoolConfig) -> Self {
        Self::with_resolver(table, Rc::new(GaiResolver::new()), net, cfg)
    }

    pub fn with_resolver(
        table: IoTable,
        resolver: Rc<dyn Resolve>,
        net: NetConfig,
        cfg: PoolConfig,
    ) -> Self {
        SocketPool {
            shared: Rc::new(PoolShared {
                table,
                resolver,
                net,
                cfg,
                buckets: RefCell::new(HashMap::new()),
                closed: Cell::new(false),
                next_id: Cell::new(1),
            }),
        }
    }

    fn bucket(&self, endpoint: &Endpoint) -> Rc<Bucket> {
        let key = endpoint.key();
        let mut buckets = self.shared.buckets.borrow_mut();
        if let Some(bucket) = buckets.get(&key) {
            return Rc::clone(bucket);
        }
        let bucket = Rc::new(Bucket {
            key: key.clone(),
            endpoint: endpoint.clone(),
            pool: Rc::downgrade(&self.shared),
            idle: RefCell::new(Vec::new()),
            jobs: RefCell::new(Vec::new()),
            waiters: RefCell::new(VecDeque::new()),
            leased: Cell::new(0),
        });
        buckets.insert(key, Rc::clone(&bucket));
        bucket
    }

    fn lookup(&self, dest: &str) -> Option<Rc<Bucket>> {
        let endpoint = Endpoint::parse(dest).ok()?;
        self.shared.buckets.borrow().get(&endpoint.key()).cloned()
    }

    /// Requests a connection to `dest` (`host:port`).
    ///
    /// A live idle socket is handed back on the next turn with no new
    /// connect. Otherwise the request queues (FIFO per destination) and a
    /// fresh connect job starts when there are fewer jobs in flight than
    /// queued requests — each job satisfies exactly one request. The
    /// callback fires exactly once: a socket, the connect error, or
    /// [`NetError::BorrowTimeout`] if `timeout` elapses first.
    pub fn get(
        &self,
        dest: &str,
        timeout: Duration,
        cb: GetCallback,
    ) -> Result<PoolRequest, NetError> {
        if self.shared.closed.get() {
            return Err(NetError::PoolClosed);
        }
        let endpoint = Endpoint::parse(dest)?;
        let bucket = self.bucket(&endpoint);

        let req = Rc::new(BorrowReq {
            id: self.shared.fresh_id(),
            bucket: Rc::downgrade(&bucket),
            phase: Cell::new(ReqPhase::Waiting),
            timer: Timer::new(),
            sock: RefCell::new(None),
            callback: RefCell::new(Some(cb)),
        });

        // Idle sockets first, most recently parked first; dead ones are
        // discarded and the search continues.
        loop {
            let entry = bucket.idle.borrow_mut().pop();
            let Some(entry) = entry else {
                break;
            };
            entry.timer.cancel();
            if entry.sock.is_alive() {
                Bucket::assign(&bucket, &req, entry.sock);
                return Ok(PoolRequest { req });
            }
            tracing::debug!(
                endpoint = %bucket.key,
                socket = entry.sock.id(),
                health = ?entry.sock.health(),
                "dropping unusable idle socket"
            );
            Bucket::forget(&entry.sock);
        }

        let rc = Rc::clone(&req);
        req.timer.schedule(timeout, move || {
            BorrowReq::timed_out(&rc);
        });
        bucket.waiters.borrow_mut().push_back(Rc::clone(&req));
        Bucket::maybe_connect(&bucket);
        Ok(PoolRequest { req })
    }

    /// Returns a leased socket. The oldest waiter (if any) gets it
    /// directly; otherwise it joins the idle list with an expiry timer,
    /// or is closed when the idle list is full.
    ///
    /// Panics if the socket did not come from this pool or is not
    /// currently leased — both are caller bugs the one-owner invariant
    /// refuses to absorb.
    pub fn put(&self, sock: Socket) {
        let key = sock
            .with_ctx::<PoolMember, _>(CtxTag::POOL, |m| {
                assert!(m.leased.get(), "socket returned to pool twice");
                m.key.clone()
            })
            .expect("socket does not belong to a pool");
        let bucket = self
            .shared
            .buckets
            .borrow()
            .get(&key)
            .cloned()
            .expect("pool bucket vanished while socket was leased");
        Bucket::release(&bucket, sock);
    }

    /// Removes a leased socket from pool accounting and closes it. For
    /// sockets known to be protocol-dirty (mid-response, errored) and
    /// unsafe to reuse.
    pub fn discard(&self, sock: Socket) {
        self.detach(&sock);
        tracing::debug!(socket = sock.id(), "socket discarded");
    }

    /// Removes a leased socket from pool accounting without closing it;
    /// the caller keeps the socket and the pool forgets it ever existed.
    pub fn detach(&self, sock: &Socket) {
        let info = sock.with_ctx::<PoolMember, _>(CtxTag::POOL, |m| (m.key.clone(), m.leased.get()));
        let Some((key, leased)) = info else {
            return;
        };
        if leased {
            let bucket = self.shared.buckets.borrow().get(&key).cloned();
            if let Some(bucket) = bucket {
                bucket.leased.set(bucket.leased.get().saturating_sub(1));
                // Freed capacity may unblock a queued request that the
                // total cap was holding back.
                Bucket::maybe_connect(&bucket);
            }
        }
        Bucket::forget(sock);
    }

    /// Closes idle sockets, cancels in-flight connects, and fails queued
    /// requests with [`NetError::PoolClosed`]. Leased sockets stay with
    /// their owners; returning them after shutdown closes them.
    pub fn shutdown(&self) {
        if self.shared.closed.replace(true) {
            return;
        }
        tracing::debug!("pool shutting down");
        let buckets: Vec<_> = self.shared.buckets.borrow().values().cloned().collect();
        for bucket in buckets {
            for entry in bucket.idle.borrow_mut().drain(..) {
                entry.timer.cancel();
                Bucket::forget(&entry.sock);
            }
            for (_, job) in bucket.jobs.borrow_mut().drain(..) {
                job.cancel();
            }
            let drained: Vec<_> = bucket.waiters.borrow_mut().drain(..).collect();
            for w in drained {
                w.timer.cancel();
                w.phase.set(ReqPhase::Done);
                if let Some(cb) = w.callback.borrow_mut().take() {
                    cb(Err(NetError::PoolClosed));
                }
            }
        }
    }

    // Introspection; the property tests watch these.

    pub fn idle_count(&self, dest: &str) -> usize {
        self.lookup(dest).map_or(0, |b| b.idle.borrow().len())
    }

    pub fn pending_count(&self, dest: &str) -> usize {
        self.lookup(dest).map_or(0, |b| b.jobs.borrow().len())
    }

    pub fn leased_count(&self, dest: &str) -> usize {
        self.lookup(dest).map_or(0, |b| b.leased.get())
    }

    pub fn waiting_count(&self, dest: &str) -> usize {
        self.lookup(dest).map_or(0, |b| b.waiters.borrow().len())
    }

    /// idle + connecting + leased for one destination.
    pub fn total_count(&self, dest: &str) -> usize {
        self.lookup(dest).map_or(0, |b| b.total())
    }
}

impl std::fmt::Debug for SocketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPool")
            .field("destinations", &self.shared.buckets.borrow().len())
            .field("closed", &self.shared.closed.get())
            .finish()
    }
}
