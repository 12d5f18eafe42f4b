//! TCP echo server.
//!
//! One engine thread, one session per accepted connection, one read and
//! one write in flight per session. Exercises the asynchronous accept,
//! read, and write paths end to end.
//!
//! Usage:
//!     cargo run --release -p sockmux-echo -- [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 7000

use std::cell::RefCell;
use std::rc::Rc;

use sockmux::{Address, Buffer, Descriptor, Engine, MuxResult, TcpService};
use sockmux::service::ReuseAddr;
use sockmux_core::{kerror, kinfo, kprint, ktrace};

const BUF_SIZE: usize = 4096;

struct Session {
    tcp: TcpService,
    handle: Rc<Descriptor>,
    peer: Address,
    buf: RefCell<Vec<u8>>,
}

impl Session {
    fn start(tcp: TcpService, handle: Rc<Descriptor>, peer: Address) {
        ktrace!("echo: session up, peer={}", peer);
        let session = Rc::new(Session {
            tcp,
            handle,
            peer,
            buf: RefCell::new(vec![0u8; BUF_SIZE]),
        });
        Self::read(session);
    }

    fn read(session: Rc<Session>) {
        let buf = {
            let mut b = session.buf.borrow_mut();
            Buffer::from_raw(b.as_mut_ptr(), b.len())
        };
        let tcp = session.tcp.clone();
        let handle = session.handle.clone();
        tcp.async_read(
            &handle,
            buf,
            Box::new(move |res| match res {
                Ok(0) => session.finish(Ok(())),
                Ok(n) => Self::write(session, n),
                Err(e) => session.finish(Err(e)),
            }),
        );
    }

    fn write(session: Rc<Session>, n: usize) {
        let buf = {
            let mut b = session.buf.borrow_mut();
            Buffer::from_raw(b.as_mut_ptr(), n)
        };
        let tcp = session.tcp.clone();
        let handle = session.handle.clone();
        tcp.async_write(
            &handle,
            buf,
            Box::new(move |res| match res {
                Ok(_) => Self::read(session),
                Err(e) => session.finish(Err(e)),
            }),
        );
    }

    fn finish(&self, result: MuxResult<()>) {
        match result {
            Ok(()) => ktrace!("echo: session down, peer={}", self.peer),
            Err(e) => kinfo!("echo: session error, peer={}: {}", self.peer, e),
        }
        self.tcp.close(&self.handle);
    }
}

fn accept_loop(tcp: TcpService, listener: Rc<Descriptor>) {
    let next = tcp.clone();
    let again = listener.clone();
    tcp.async_accept(
        &listener,
        Box::new(move |res| match res {
            Ok((handle, peer)) => {
                if let Err(e) = next.set_nonblocking(&handle, true) {
                    kerror!("echo: set_nonblocking: {}", e);
                    next.close(&handle);
                } else {
                    Session::start(next.clone(), handle, peer);
                }
                accept_loop(next, again);
            }
            Err(e) => {
                kerror!("echo: accept: {}", e);
                next.close(&again);
            }
        }),
    );
}

fn serve(port: u16) -> MuxResult<()> {
    let engine = Engine::new()?;
    let tcp = engine.tcp().clone();

    let listener = tcp.open(libc::AF_INET)?;
    tcp.set_option(&listener, &ReuseAddr(true))?;
    tcp.bind(&listener, &Address::any(port, libc::AF_INET)?)?;
    tcp.listen(&listener, 128)?;
    tcp.set_nonblocking(&listener, true)?;
    kinfo!("echo: listening on {}", tcp.local_address(&listener)?);

    accept_loop(tcp, listener);
    engine.run();
    Ok(())
}

fn main() {
    kprint::init();
    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7000);
    if let Err(e) = serve(port) {
        kerror!("echo: {}", e);
        std::process::exit(1);
    }
}
