//! End-to-end exchange tests.
//!
//! Covers:
//! - A request/response round trip over a pooled connection, through the
//!   buffered context, on both I/O models
//! - Returning the connection to the pool after a clean release

use kvnet::io::{block_on, IoTable};
use kvnet::socket::{CtxProcs, IoContext, SocketPool};
use kvnet::dns::{Resolve, StaticResolver};
use kvnet::{NetConfig, PoolConfig};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::rc::Rc;
use std::time::Duration;

fn local_resolver() -> Rc<dyn Resolve> {
    let mut r = StaticResolver::new();
    r.insert("db.local", vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)]);
    Rc::new(r)
}

#[test]
fn request_response_over_pooled_connection() {
    for table in [IoTable::event(), IoTable::completion()] {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut req = [0u8; 5];
            conn.read_exact(&mut req).unwrap();
            assert_eq!(&req, b"ping\n");
            conn.write_all(b"pong!").unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });

        block_on(async move {
            let pool = SocketPool::with_resolver(
                table,
                local_resolver(),
                NetConfig { keepalive: false, ..Default::default() },
                PoolConfig::default(),
            );
            let dest = format!("db.local:{port}");

            let got: Rc<RefCell<Option<kvnet::socket::Socket>>> = Rc::new(RefCell::new(None));
            let g = Rc::clone(&got);
            let _req = pool
                .get(&dest, Duration::from_secs(5), Box::new(move |res| {
                    *g.borrow_mut() = Some(res.unwrap());
                }))
                .unwrap();
            while got.borrow().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let sock = got.borrow_mut().take().unwrap();

            let response: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
            let r = Rc::clone(&response);
            let ctx = IoContext::bind(
                sock.clone(),
                CtxProcs::new(
                    move |ctx, total| {
                        for chunk in ctx.chunks() {
                            r.borrow_mut().extend_from_slice(&chunk);
                        }
                        ctx.consume(total);
                    },
                    |_ctx, err| panic!("context error: {err:?}"),
                ),
            );
            ctx.enqueue_write(b"ping\n");
            ctx.request_bytes(5);
            ctx.schedule();

            while response.borrow().len() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(&*response.borrow(), b"pong!");

            // Clean release: the socket goes back into the pool.
            let reusable = Rc::new(Cell::new(None));
            let v = Rc::clone(&reusable);
            ctx.close(Some(Box::new(move |_s, ok| v.set(Some(ok)))));
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert_eq!(reusable.get(), Some(true));

            pool.put(sock);
            assert_eq!(pool.idle_count(&dest), 1);
        });
        server.join().unwrap();
    }
}
