//! The normalized I/O capability table.
//!
//! One reactor instance owns one [`IoTable`]. The table is a closed set of
//! two variants, chosen once at construction and shared (reference
//! counted) by every socket created through it:
//!
//! - [`IoTable::event`]: readiness notification. The caller arms a watch,
//!   gets told "ready", and performs the non-blocking reads/writes itself.
//! - [`IoTable::completion`]: the runtime owns the buffer for the duration
//!   of the operation and invokes a callback with the result and byte
//!   count once it has fully completed.
//!
//! Layers above query this table instead of branching on backend identity;
//! the only dual-path sites are the two scheduling algorithms inside
//! `socket::context`. The table performs no buffering of its own.

pub mod completion;
pub mod event;
pub mod timer;

pub use completion::CompletionIo;
pub use event::EventIo;
pub use timer::Timer;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;

/// Which execution model a table implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoModel {
    Event,
    Completion,
}

/// Capability table over one of the two I/O execution models.
///
/// Cloning is cheap (reference counted, no atomics); all clones refer to
/// the same backend instance.
#[derive(Clone)]
pub enum IoTable {
    Event(Rc<EventIo>),
    Completion(Rc<CompletionIo>),
}

impl IoTable {
    pub fn event() -> Self {
        IoTable::Event(Rc::new(EventIo::new()))
    }

    pub fn completion() -> Self {
        IoTable::Completion(Rc::new(CompletionIo::new()))
    }

    pub fn model(&self) -> IoModel {
        match self {
            IoTable::Event(_) => IoModel::Event,
            IoTable::Completion(_) => IoModel::Completion,
        }
    }

    /// Timer sub-table. Both backends normalize to the runtime's timer
    /// wheel, so this is a plain constructor rather than a dispatch.
    pub fn timer(&self) -> Timer {
        Timer::new()
    }

    /// Starts a non-blocking connect to one address. The callback is
    /// invoked on a later reactor turn with the connected stream or the
    /// OS error; dropping the returned handle before then cancels the
    /// operation and suppresses the callback.
    ///
    /// Connect semantics are identical across the two models (the event
    /// table waits on writability, the completion table on the runtime's
    /// completion), so both route through the same primitive.
    pub(crate) fn connect(
        &self,
        addr: SocketAddr,
        cb: Box<dyn FnOnce(io::Result<TcpStream>)>,
    ) -> OpHandle {
        let handle = tokio::task::spawn_local(async move {
            let res = TcpStream::connect(addr).await;
            cb(res);
        });
        OpHandle::new(handle.abort_handle())
    }
}

impl std::fmt::Debug for IoTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoTable").field("model", &self.model()).finish()
    }
}

/// Handle to one in-flight backend operation. Dropping it aborts the
/// operation; the operation's callback never runs after that.
pub(crate) struct OpHandle {
    abort: Option<AbortHandle>,
}

impl OpHandle {
    pub(crate) fn new(abort: AbortHandle) -> Self {
        OpHandle { abort: Some(abort) }
    }

    /// Forgets the operation without aborting it (it already completed).
    pub(crate) fn disarm(mut self) {
        self.abort.take();
    }
}

impl Drop for OpHandle {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

/// Runs a future to completion on a fresh single-threaded reactor.
///
/// Everything in this crate assumes a current-thread runtime with a
/// `LocalSet` on top (state is `Rc`-counted and tasks are spawned with
/// `spawn_local`); this helper builds exactly that. Embedders that already
/// drive their own `LocalSet` do not need it.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("reactor construction failed");
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(fut))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::TcpListener;

    #[test]
    fn models_are_distinct() {
        assert_eq!(IoTable::event().model(), IoModel::Event);
        assert_eq!(IoTable::completion().model(), IoModel::Completion);
    }

    #[test]
    fn connect_invokes_callback_with_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        block_on(async move {
            let table = IoTable::event();
            let got: Rc<Cell<bool>> = Rc::new(Cell::new(false));
            let got2 = Rc::clone(&got);
            let op = table.connect(
                addr,
                Box::new(move |res| {
                    assert!(res.is_ok());
                    got2.set(true);
                }),
            );
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            assert!(got.get());
            op.disarm();
        });
    }

    #[test]
    fn dropped_op_suppresses_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        block_on(async move {
            let table = IoTable::event();
            let got: Rc<Cell<bool>> = Rc::new(Cell::new(false));
            let got2 = Rc::clone(&got);
            let op = table.connect(addr, Box::new(move |_| got2.set(true)));
            drop(op);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            assert!(!got.get());
        });
    }
}
