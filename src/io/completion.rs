//! Completion-based backend primitives.
//!
//! In this model the runtime owns the operation: the caller hands over a
//! buffer (read) or a set of buffers (write), and a callback fires once
//! the operation has completed with a result code and byte count. At most
//! one read and one write are outstanding per stream at any time — the
//! buffering layer's completion scheduler enforces that.
//!
//! Operations are not cancellable mid-flight the way a readiness watch
//! is; the owner counts them as pending and defers its own teardown until
//! they drain (or aborts them wholesale when the transport is being
//! abandoned, which is this model's equivalent of closing the handle out
//! from under queued operations).

use crate::io::OpHandle;
use bytes::{Bytes, BytesMut};
use std::io;
use std::rc::Rc;
use tokio::net::TcpStream;

/// The completion backend. Stateless, like its event twin.
#[derive(Debug, Default)]
pub struct CompletionIo {
    _priv: (),
}

impl CompletionIo {
    pub fn new() -> Self {
        CompletionIo { _priv: () }
    }

    /// Submits a read into `buf`. Completes with the byte count appended
    /// to `buf` (0 means the peer shut down) or the OS error; the buffer
    /// travels with the callback in either case so ownership returns to
    /// the caller.
    pub(crate) fn start_read(
        &self,
        stream: Rc<TcpStream>,
        mut buf: BytesMut,
        cb: Box<dyn FnOnce(io::Result<usize>, BytesMut)>,
    ) -> OpHandle {
        let handle = tokio::task::spawn_local(async move {
            loop {
                match stream.try_read_buf(&mut buf) {
                    Ok(n) => {
                        cb(Ok(n), buf);
                        return;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if let Err(e) = stream.readable().await {
                            cb(Err(e), buf);
                            return;
                        }
                    }
                    Err(e) => {
                        cb(Err(e), buf);
                        return;
                    }
                }
            }
        });
        OpHandle::new(handle.abort_handle())
    }

    /// Submits a vectored write of `bufs`. Completes with the number of
    /// bytes the transport accepted, which may be less than the total
    /// supplied — the caller keeps the unaccepted tail and submits again.
    pub(crate) fn start_write(
        &self,
        stream: Rc<TcpStream>,
        bufs: Vec<Bytes>,
        cb: Box<dyn FnOnce(io::Result<usize>)>,
    ) -> OpHandle {
        let handle = tokio::task::spawn_local(async move {
            loop {
                let slices: Vec<io::IoSlice<'_>> =
                    bufs.iter().map(|b| io::IoSlice::new(b)).collect();
                match stream.try_write_vectored(&slices) {
                    Ok(n) => {
                        cb(Ok(n));
                        return;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if let Err(e) = stream.writable().await {
                            cb(Err(e));
                            return;
                        }
                    }
                    Err(e) => {
                        cb(Err(e));
                        return;
                    }
                }
            }
        });
        OpHandle::new(handle.abort_handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::block_on;
    use std::cell::Cell;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn read_completes_with_data() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"pong").unwrap();
            std::thread::sleep(Duration::from_millis(100));
        });

        block_on(async move {
            let stream = Rc::new(TcpStream::connect(addr).await.unwrap());
            let io = CompletionIo::new();
            let got = Rc::new(Cell::new(0usize));
            let g = Rc::clone(&got);
            let op = io.start_read(
                stream,
                BytesMut::with_capacity(64),
                Box::new(move |res, buf| {
                    let n = res.unwrap();
                    assert_eq!(&buf[..n], b"pong");
                    g.set(n);
                }),
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(got.get(), 4);
            op.disarm();
        });
        server.join().unwrap();
    }

    #[test]
    fn write_reports_accepted_bytes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut sink = Vec::new();
            std::io::Read::read_to_end(&mut conn, &mut sink).unwrap();
            sink
        });

        block_on(async move {
            let stream = Rc::new(TcpStream::connect(addr).await.unwrap());
            let io = CompletionIo::new();
            let done = Rc::new(Cell::new(0usize));
            let d = Rc::clone(&done);
            let op = io.start_write(
                stream,
                vec![Bytes::from_static(b"ping "), Bytes::from_static(b"pong")],
                Box::new(move |res| d.set(res.unwrap())),
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(done.get(), 9);
            op.disarm();
        });
        assert_eq!(server.join().unwrap(), b"ping pong");
    }
}
