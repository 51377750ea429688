//! The connect state machine: resolve once, walk the candidate list,
//! race it all against a deadline.

use crate::base::neterror::NetError;
use crate::config::{Endpoint, NetConfig, WrapHook};
use crate::dns::{order_by_preference, Name, Resolve};
use crate::io::{IoTable, OpHandle, Timer};
use crate::socket::handle::Socket;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

/// Terminal-outcome callback. Fires exactly once per job: a usable socket,
/// or an error (with the OS errno retrievable via
/// [`NetError::os_errno`]). A cancelled job fires nothing.
pub type ConnectCallback = Box<dyn FnOnce(Result<Socket, NetError>)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobState {
    Pending,
    Connected,
    Failed,
    Cancelled,
}

/// What one address attempt concluded. The bounded retry loop in
/// [`JobInner::try_next`] advances on `TryNext` and stops on
/// `Established`; "interrupted, retry the same address" does not surface
/// here because the runtime absorbs `EINTR` inside its connect primitive.
enum AttemptOutcome {
    Established(tokio::net::TcpStream),
    TryNext(NetError),
}

/// Options for one connect job, typically derived from [`NetConfig`].
pub struct ConnectOptions {
    pub timeout: Duration,
    pub nodelay: bool,
    pub keepalive: bool,
    pub ip: crate::config::IpPreference,
    pub wrap: Option<WrapHook>,
}

impl From<&NetConfig> for ConnectOptions {
    fn from(cfg: &NetConfig) -> Self {
        ConnectOptions {
            timeout: cfg.connect_timeout(),
            nodelay: cfg.nodelay,
            keepalive: cfg.keepalive,
            ip: cfg.ip,
            wrap: cfg.wrap.clone(),
        }
    }
}

struct JobInner {
    table: IoTable,
    endpoint: Endpoint,
    opts: ConnectOptions,
    state: Cell<JobState>,
    last_err: Cell<Option<NetError>>,
    deadline: Timer,
    callback: RefCell<Option<ConnectCallback>>,
    op: RefCell<Option<OpHandle>>,
    in_callback: Cell<bool>,
}

/// A cancellable, in-flight connection attempt.
///
/// The job resolves its endpoint once at start (resolution failure is
/// terminal), then tries each candidate address in order: transient
/// per-address errors advance the cursor, and exhausting the list surfaces
/// the last recorded error. A deadline timer armed at start forces a
/// timeout error, but only while the job is still pending — the first
/// terminal transition is sticky, so a connection that completes
/// concurrently with the timer wins if it gets there first.
pub struct ConnectJob {
    inner: Rc<JobInner>,
}

impl ConnectJob {
    /// Starts a connect job. The callback fires on a later reactor turn,
    /// never from inside `start`.
    pub fn start(
        table: IoTable,
        resolver: Rc<dyn Resolve>,
        endpoint: Endpoint,
        opts: ConnectOptions,
        cb: ConnectCallback,
    ) -> ConnectJob {
        let timeout = opts.timeout;
        let inner = Rc::new(JobInner {
            table,
            endpoint: endpoint.clone(),
            opts,
            state: Cell::new(JobState::Pending),
            last_err: Cell::new(None),
            deadline: Timer::new(),
            callback: RefCell::new(Some(cb)),
            op: RefCell::new(None),
            in_callback: Cell::new(false),
        });
        tracing::debug!(endpoint = %endpoint, ?timeout, "starting connect");

        let rc = Rc::clone(&inner);
        inner.deadline.schedule(timeout, move || {
            JobInner::deadline_fired(&rc);
        });

        let rc = Rc::clone(&inner);
        let fut = resolver.resolve(Name::new(endpoint.host()), endpoint.port());
        let resolve_task = tokio::task::spawn_local(async move {
            let result = fut.await;
            if let Some(op) = rc.op.borrow_mut().take() {
                op.disarm();
            }
            JobInner::resolved(&rc, result);
        });
        *inner.op.borrow_mut() = Some(OpHandle::new(resolve_task.abort_handle()));

        ConnectJob { inner }
    }

    /// Cancels the job. Effective only while no terminal callback has
    /// begun: once the job is connected, failed, or already inside its
    /// callback, this is a no-op. Cancellation suppresses the callback
    /// rather than invoking it with an error.
    pub fn cancel(&self) {
        if self.inner.in_callback.get() || self.inner.state.get() != JobState::Pending {
            return;
        }
        tracing::debug!(endpoint = %self.inner.endpoint, "connect cancelled");
        self.inner.state.set(JobState::Cancelled);
        self.inner.deadline.cancel();
        self.inner.op.borrow_mut().take();
        self.inner.callback.borrow_mut().take();
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.get() != JobState::Pending
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }
}

impl JobInner {
    fn resolved(inner: &Rc<JobInner>, result: Result<Vec<SocketAddr>, NetError>) {
        if inner.state.get() != JobState::Pending {
            return;
        }
        match result {
            Ok(addrs) => {
                let addrs = order_by_preference(addrs, inner.opts.ip);
                if addrs.is_empty() {
                    JobInner::finish(inner, Err(NetError::NameNotResolved));
                } else {
                    tracing::trace!(
                        endpoint = %inner.endpoint,
                        candidates = addrs.len(),
                        "resolved, trying addresses"
                    );
                    JobInner::try_next(inner, Rc::new(addrs), 0);
                }
            }
            Err(err) => JobInner::finish(inner, Err(err)),
        }
    }

    fn try_next(inner: &Rc<JobInner>, addrs: Rc<Vec<SocketAddr>>, cursor: usize) {
        if inner.state.get() != JobState::Pending {
            return;
        }
        let Some(addr) = addrs.get(cursor).copied() else {
            let err = inner
                .last_err
                .get()
                .unwrap_or(NetError::ConnectFailed { errno: None });
            JobInner::finish(inner, Err(err));
            return;
        };

        let rc = Rc::clone(inner);
        let next = Rc::clone(&addrs);
        let op = inner.table.connect(
            addr,
            Box::new(move |res| {
                if let Some(op) = rc.op.borrow_mut().take() {
                    op.disarm();
                }
                let outcome = match res {
                    Ok(stream) => AttemptOutcome::Established(stream),
                    Err(e) => {
                        tracing::trace!(%addr, error = %e, "address attempt failed");
                        AttemptOutcome::TryNext(NetError::from_connect(&e))
                    }
                };
                match outcome {
                    AttemptOutcome::Established(stream) => JobInner::established(&rc, stream),
                    AttemptOutcome::TryNext(err) => {
                        rc.last_err.set(Some(err));
                        JobInner::try_next(&rc, next, cursor + 1);
                    }
                }
            }),
        );
        *inner.op.borrow_mut() = Some(op);
    }

    fn established(inner: &Rc<JobInner>, stream: tokio::net::TcpStream) {
        if inner.state.get() != JobState::Pending {
            // Late completion after timeout or cancel: close and walk away.
            return;
        }
        JobInner::tune(inner, &stream);
        match Socket::from_stream(inner.table.clone(), stream) {
            Ok(sock) => {
                if let Some(wrap) = &inner.opts.wrap {
                    sock.run_wrap_hook(&**wrap);
                }
                JobInner::finish(inner, Ok(sock));
            }
            Err(e) => {
                // The connection died between connect and addr lookup;
                // treat it like any transient address failure.
                inner.last_err.set(Some(NetError::from_connect(&e)));
                JobInner::finish(
                    inner,
                    Err(inner.last_err.get().unwrap_or(NetError::Internal)),
                );
            }
        }
    }

    /// Best-effort socket-option tuning; failures are logged, not fatal.
    fn tune(inner: &Rc<JobInner>, stream: &tokio::net::TcpStream) {
        if inner.opts.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!(endpoint = %inner.endpoint, error = %e, "TCP_NODELAY failed");
            }
        }
        if inner.opts.keepalive {
            let sock = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
            if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
                tracing::warn!(endpoint = %inner.endpoint, error = %e, "SO_KEEPALIVE failed");
            }
        }
    }

    fn deadline_fired(inner: &Rc<JobInner>) {
        if inner.state.get() != JobState::Pending {
            return;
        }
        tracing::debug!(endpoint = %inner.endpoint, "connect deadline elapsed");
        JobInner::finish(inner, Err(NetError::TimedOut));
    }

    fn finish(inner: &Rc<JobInner>, outcome: Result<Socket, NetError>) {
        if inner.state.get() != JobState::Pending {
            return;
        }
        inner.state.set(match &outcome {
            Ok(_) => JobState::Connected,
            Err(_) => JobState::Failed,
        });
        inner.deadline.cancel();
        inner.op.borrow_mut().take();

        match &outcome {
            Ok(sock) => {
                tracing::debug!(endpoint = %inner.endpoint, socket = sock.id(), "connected")
            }
            Err(err) => {
                tracing::debug!(endpoint = %inner.endpoint, error = %err, "connect failed")
            }
        }

        if let Some(cb) = inner.callback.borrow_mut().take() {
            inner.in_callback.set(true);
            cb(outcome);
            inner.in_callback.set(false);
        }
    }
}

/// Starts a connect job for the first endpoint in `hosts` that parses.
///
/// This is the rotating-host convenience: callers that track a list of
/// cluster nodes hand the whole rotation in and get one job for the first
/// viable entry. It does not retry across hosts — if that one job fails,
/// the caller advances its rotation and calls again.
pub fn connect_to_any(
    table: IoTable,
    resolver: Rc<dyn Resolve>,
    hosts: &[&str],
    opts: ConnectOptions,
    cb: ConnectCallback,
) -> Result<ConnectJob, NetError> {
    for host in hosts {
        match Endpoint::parse(host) {
            Ok(endpoint) => {
                return Ok(ConnectJob::start(table, resolver, endpoint, opts, cb));
            }
            Err(_) => {
                tracing::warn!(host = %host, "skipping unparseable host");
            }
        }
    }
    Err(NetError::BadEndpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use crate::io::block_on;
    use futures::future::pending;
    use std::net::{IpAddr, Ipv4Addr, TcpListener};

    fn opts(timeout_ms: u64) -> ConnectOptions {
        ConnectOptions {
            timeout: Duration::from_millis(timeout_ms),
            nodelay: true,
            keepalive: false,
            ip: crate::config::IpPreference::Any,
            wrap: None,
        }
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// A resolver whose future never completes; the deadline always wins.
    struct NeverResolver;

    impl Resolve for NeverResolver {
        fn resolve(&self, _name: Name, _port: u16) -> crate::dns::Resolving {
            Box::pin(pending())
        }
    }

    fn free_port() -> u16 {
        // Bind and drop; connecting to the released port gets RST on
        // loopback.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn connects_and_reports_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        block_on(async move {
            let mut resolver = StaticResolver::new();
            resolver.insert("db.local", vec![loopback(0)]);

            let outcome = Rc::new(RefCell::new(None));
            let o = Rc::clone(&outcome);
            let _job = ConnectJob::start(
                IoTable::event(),
                Rc::new(resolver),
                Endpoint::new("db.local", port).unwrap(),
                opts(2000),
                Box::new(move |res| *o.borrow_mut() = Some(res)),
            );
            tokio::time::sleep(Duration::from_millis(100)).await;

            let outcome = outcome.borrow_mut().take().expect("callback must have fired");
            let sock = outcome.expect("connect should succeed");
            assert_eq!(sock.peer_addr().port(), port);
        });
    }

    #[test]
    fn falls_back_to_next_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap().port();
        let dead = free_port();

        block_on(async move {
            let mut resolver = StaticResolver::new();
            resolver.insert("db.local", vec![loopback(dead), loopback(live)]);

            let outcome = Rc::new(RefCell::new(None));
            let o = Rc::clone(&outcome);
            let _job = ConnectJob::start(
                IoTable::event(),
                Rc::new(resolver),
                // Endpoint port is irrelevant: the resolver pins explicit ports.
                Endpoint::new("db.local", 1).unwrap(),
                opts(2000),
                Box::new(move |res| *o.borrow_mut() = Some(res)),
            );
            tokio::time::sleep(Duration::from_millis(200)).await;

            let sock = outcome.borrow_mut().take().unwrap().expect("second address works");
            assert_eq!(sock.peer_addr().port(), live);
        });
    }

    #[test]
    fn exhausted_list_surfaces_last_error() {
        let dead = free_port();

        block_on(async move {
            let mut resolver = StaticResolver::new();
            resolver.insert("db.local", vec![loopback(dead)]);

            let outcome = Rc::new(RefCell::new(None));
            let o = Rc::clone(&outcome);
            let _job = ConnectJob::start(
                IoTable::event(),
                Rc::new(resolver),
                Endpoint::new("db.local", 1).unwrap(),
                opts(2000),
                Box::new(move |res| *o.borrow_mut() = Some(res)),
            );
            tokio::time::sleep(Duration::from_millis(200)).await;

            let err = outcome.borrow_mut().take().unwrap().unwrap_err();
            assert!(
                matches!(err, NetError::ConnectionRefused { .. }),
                "unexpected error: {err:?}"
            );
        });
    }

    #[test]
    fn resolution_failure_is_terminal() {
        block_on(async move {
            let outcome = Rc::new(RefCell::new(None));
            let o = Rc::clone(&outcome);
            let _job = ConnectJob::start(
                IoTable::event(),
                Rc::new(StaticResolver::new()),
                Endpoint::new("unknown.local", 1).unwrap(),
                opts(2000),
                Box::new(move |res| *o.borrow_mut() = Some(res)),
            );
            tokio::time::sleep(Duration::from_millis(50)).await;

            let err = outcome.borrow_mut().take().unwrap().unwrap_err();
            assert_eq!(err, NetError::NameNotResolved);
        });
    }

    #[test]
    fn deadline_beats_slow_resolution() {
        block_on(async move {
            let outcome = Rc::new(RefCell::new(None));
            let o = Rc::clone(&outcome);
            let _job = ConnectJob::start(
                IoTable::event(),
                Rc::new(NeverResolver),
                Endpoint::new("db.local", 1).unwrap(),
                opts(20),
                Box::new(move |res| *o.borrow_mut() = Some(res)),
            );
            tokio::time::sleep(Duration::from_millis(100)).await;

            let err = outcome.borrow_mut().take().unwrap().unwrap_err();
            assert_eq!(err, NetError::TimedOut);
        });
    }

    #[test]
    fn cancel_suppresses_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        block_on(async move {
            let mut resolver = StaticResolver::new();
            resolver.insert("db.local", vec![loopback(0)]);

            let fired = Rc::new(Cell::new(false));
            let f = Rc::clone(&fired);
            let job = ConnectJob::start(
                IoTable::event(),
                Rc::new(resolver),
                Endpoint::new("db.local", port).unwrap(),
                opts(2000),
                Box::new(move |_| f.set(true)),
            );
            job.cancel();
            assert!(job.is_done());
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!fired.get(), "cancelled job must not call back");
        });
    }

    #[test]
    fn works_on_completion_table_too() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        block_on(async move {
            let mut resolver = StaticResolver::new();
            resolver.insert("db.local", vec![loopback(0)]);

            let outcome = Rc::new(RefCell::new(None));
            let o = Rc::clone(&outcome);
            let _job = ConnectJob::start(
                IoTable::completion(),
                Rc::new(resolver),
                Endpoint::new("db.local", port).unwrap(),
                opts(2000),
                Box::new(move |res| *o.borrow_mut() = Some(res)),
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(outcome.borrow_mut().take().unwrap().is_ok());
        });
    }

    #[test]
    fn connect_to_any_skips_bad_hosts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let good = format!("127.0.0.1:{port}");

        block_on(async move {
            let outcome = Rc::new(RefCell::new(None));
            let o = Rc::clone(&outcome);
            let job = connect_to_any(
                IoTable::event(),
                Rc::new(GaiLike),
                &["not a host", good.as_str()],
                opts(2000),
                Box::new(move |res| *o.borrow_mut() = Some(res)),
            )
            .expect("one host parses");
            assert_eq!(job.endpoint().port(), port);
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(outcome.borrow_mut().take().unwrap().is_ok());
        });
    }

    #[test]
    fn connect_to_any_rejects_all_bad() {
        block_on(async {
            let err = connect_to_any(
                IoTable::event(),
                Rc::new(StaticResolver::new()),
                &["nope", "also:bad:port"],
                opts(10),
                Box::new(|_| {}),
            )
            .err()
            .unwrap();
            assert_eq!(err, NetError::BadEndpoint);
        });
    }

    /// Resolves IP-literal hosts only; enough for `connect_to_any` tests.
    struct GaiLike;

    impl Resolve for GaiLike {
        fn resolve(&self, name: Name, port: u16) -> crate::dns::Resolving {
            let result = name
                .as_str()
                .parse::<IpAddr>()
                .map(|ip| vec![SocketAddr::new(ip, port)])
                .map_err(|_| NetError::NameNotResolved);
            Box::pin(std::future::ready(result))
        }
    }
}
