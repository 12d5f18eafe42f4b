//! TCP stream service.

use std::mem;
use std::rc::Rc;
use std::time::Duration;

use sockmux_core::{Buffer, MuxError, MuxResult};

use crate::addr::Address;
use crate::descriptor::{Descriptor, MASK_IN, MASK_OUT};
use crate::mux::Multiplexer;
use crate::op::{AcceptHandler, ConnectHandler, IoHandler, Operation};

use super::{
    check_open, checked, open_socket, sock_bind, sock_connect, sock_local, sock_nonblocking,
    sock_read, sock_remote, sock_write, Shutdown, SocketOption,
};

#[derive(Clone)]
pub struct TcpService {
    mux: Rc<Multiplexer>,
}

impl TcpService {
    pub(crate) fn new(mux: Rc<Multiplexer>) -> Self {
        Self { mux }
    }

    pub fn open(&self, family: libc::c_int) -> MuxResult<Rc<Descriptor>> {
        open_socket(family, libc::SOCK_STREAM)
    }

    /// Close through the drain protocol: every queued operation completes
    /// with `Canceled` before the native handle is released.
    pub fn close(&self, h: &Rc<Descriptor>) {
        self.mux.drain(h, MuxError::Canceled);
    }

    pub fn bind(&self, h: &Rc<Descriptor>, addr: &Address) -> MuxResult<()> {
        sock_bind(h, addr)
    }

    pub fn listen(&self, h: &Rc<Descriptor>, backlog: libc::c_int) -> MuxResult<()> {
        let fd = check_open(h)?;
        checked(unsafe { libc::listen(fd, backlog) })
    }

    pub fn connect(&self, h: &Rc<Descriptor>, addr: &Address) -> MuxResult<()> {
        sock_connect(h, addr)
    }

    /// Synchronous accept. The returned handle starts with empty queues and
    /// no registration.
    pub fn accept(&self, h: &Rc<Descriptor>) -> MuxResult<(Rc<Descriptor>, Address)> {
        let fd = check_open(h)?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let afd = unsafe {
            libc::accept4(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC,
            )
        };
        if afd < 0 {
            return Err(MuxError::last_os_error());
        }
        Ok((
            Rc::new(Descriptor::from_fd(afd)),
            Address::from_storage(storage, len),
        ))
    }

    pub fn shutdown(&self, h: &Rc<Descriptor>, how: Shutdown) -> MuxResult<()> {
        let fd = check_open(h)?;
        checked(unsafe { libc::shutdown(fd, how.how()) })
    }

    /// Wait for readiness on the handle itself, outside the multiplexer.
    /// `interest` is a `MASK_IN`/`MASK_OUT` combination; the return value is
    /// the subset that became ready (empty on timeout).
    pub fn poll(&self, h: &Rc<Descriptor>, interest: u8, timeout: Option<Duration>) -> MuxResult<u8> {
        let fd = check_open(h)?;
        let mut events: libc::c_short = 0;
        if interest & MASK_IN != 0 {
            events |= libc::POLLIN;
        }
        if interest & MASK_OUT != 0 {
            events |= libc::POLLOUT;
        }
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            return Err(MuxError::last_os_error());
        }
        let mut ready = 0u8;
        if pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
            ready |= MASK_IN;
        }
        if pfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0 {
            ready |= MASK_OUT;
        }
        Ok(ready)
    }

    pub fn read(&self, h: &Rc<Descriptor>, buf: &mut [u8]) -> MuxResult<usize> {
        sock_read(h, buf)
    }

    pub fn write(&self, h: &Rc<Descriptor>, buf: &[u8]) -> MuxResult<usize> {
        sock_write(h, buf)
    }

    pub fn local_address(&self, h: &Rc<Descriptor>) -> MuxResult<Address> {
        sock_local(h)
    }

    pub fn remote_address(&self, h: &Rc<Descriptor>) -> MuxResult<Address> {
        sock_remote(h)
    }

    pub fn set_option<O: SocketOption>(&self, h: &Rc<Descriptor>, opt: &O) -> MuxResult<()> {
        opt.set(check_open(h)?)
    }

    pub fn get_option<O: SocketOption>(&self, h: &Rc<Descriptor>) -> MuxResult<O> {
        O::get(check_open(h)?)
    }

    pub fn set_nonblocking(&self, h: &Rc<Descriptor>, on: bool) -> MuxResult<()> {
        sock_nonblocking(h, on)
    }

    // ── Asynchronous surface ──

    pub fn async_connect(&self, h: &Rc<Descriptor>, addr: Address, handler: ConnectHandler) {
        self.mux.submit(h, Operation::connect(addr, handler));
    }

    /// The buffer must stay valid until the handler runs; completion with
    /// `Ok(0)` means the peer closed the stream.
    pub fn async_read(&self, h: &Rc<Descriptor>, buf: Buffer, handler: IoHandler) {
        self.mux.submit(h, Operation::read(buf, handler));
    }

    pub fn async_write(&self, h: &Rc<Descriptor>, buf: Buffer, handler: IoHandler) {
        self.mux.submit(h, Operation::write(buf, handler));
    }

    pub fn async_accept(&self, h: &Rc<Descriptor>, handler: AcceptHandler) {
        self.mux.submit(h, Operation::accept(handler));
    }
}
