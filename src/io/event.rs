//! Event-driven (readiness notification) backend primitives.
//!
//! In this model the caller owns the read/write loop: it arms a one-shot
//! readiness watch, gets called back with the ready state, and performs
//! the non-blocking `try_read`/`try_write` calls itself, re-arming as long
//! as it still has interest. The buffering layer's event scheduler
//! (`socket::context`) is the only consumer.

use std::io;
use std::rc::Rc;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;

/// The readiness backend. Stateless; it exists so the capability table
/// has a concrete instance to hand out watches from.
#[derive(Debug, Default)]
pub struct EventIo {
    _priv: (),
}

impl EventIo {
    pub fn new() -> Self {
        EventIo { _priv: () }
    }

    /// Arms a one-shot readiness watch on `stream` for `interest`. The
    /// callback receives the ready state (or the readiness error) exactly
    /// once; to keep watching, the caller arms a new watch from inside
    /// the callback. Dropping the returned [`Watch`] disarms it and the
    /// callback never runs.
    pub(crate) fn watch(
        &self,
        stream: Rc<TcpStream>,
        interest: Interest,
        cb: Box<dyn FnOnce(io::Result<Ready>)>,
    ) -> Watch {
        let handle = tokio::task::spawn_local(async move {
            let ready = stream.ready(interest).await;
            cb(ready);
        });
        Watch { abort: Some(handle.abort_handle()) }
    }
}

/// An armed readiness watch. Dropping disarms.
pub(crate) struct Watch {
    abort: Option<AbortHandle>,
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::block_on;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn watch_reports_writable_after_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        block_on(async move {
            let stream = Rc::new(TcpStream::connect(addr).await.unwrap());
            let io = EventIo::new();
            let fired = Rc::new(Cell::new(false));
            let f = Rc::clone(&fired);
            let watch = io.watch(
                stream,
                Interest::WRITABLE,
                Box::new(move |ready| {
                    assert!(ready.unwrap().is_writable());
                    f.set(true);
                }),
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(fired.get());
            drop(watch);
        });
    }

    #[test]
    fn dropped_watch_never_fires() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        block_on(async move {
            let stream = Rc::new(TcpStream::connect(addr).await.unwrap());
            let io = EventIo::new();
            let fired = Rc::new(Cell::new(false));
            let f = Rc::clone(&fired);
            // Readable will not become ready (nobody writes), but even the
            // writable side must stay silent once the watch is dropped.
            let watch = io.watch(
                stream,
                Interest::WRITABLE,
                Box::new(move |_| f.set(true)),
            );
            drop(watch);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!fired.get());
        });
    }
}
