//! UDP datagram service.
//!
//! Same handle and queue protocol as TCP; the datagram calls bundle a peer
//! [`Address`] with each buffer instead of relying on a connected stream.

use std::rc::Rc;

use sockmux_core::{Buffer, MuxError, MuxResult};

use crate::addr::Address;
use crate::descriptor::Descriptor;
use crate::mux::Multiplexer;
use crate::op::{ConnectHandler, IoHandler, Operation, RecvFromHandler};

use super::{
    check_open, open_socket, sock_bind, sock_connect, sock_local, sock_nonblocking, sock_read,
    sock_remote, sock_write, SocketOption,
};

#[derive(Clone)]
pub struct UdpService {
    mux: Rc<Multiplexer>,
}

impl UdpService {
    pub(crate) fn new(mux: Rc<Multiplexer>) -> Self {
        Self { mux }
    }

    pub fn open(&self, family: libc::c_int) -> MuxResult<Rc<Descriptor>> {
        open_socket(family, libc::SOCK_DGRAM)
    }

    pub fn close(&self, h: &Rc<Descriptor>) {
        self.mux.drain(h, MuxError::Canceled);
    }

    pub fn bind(&self, h: &Rc<Descriptor>, addr: &Address) -> MuxResult<()> {
        sock_bind(h, addr)
    }

    /// Fix the default peer; `read`/`write` then work like on a stream.
    pub fn connect(&self, h: &Rc<Descriptor>, addr: &Address) -> MuxResult<()> {
        sock_connect(h, addr)
    }

    pub fn read(&self, h: &Rc<Descriptor>, buf: &mut [u8]) -> MuxResult<usize> {
        sock_read(h, buf)
    }

    pub fn write(&self, h: &Rc<Descriptor>, buf: &[u8]) -> MuxResult<usize> {
        sock_write(h, buf)
    }

    pub fn send_to(&self, h: &Rc<Descriptor>, buf: &[u8], addr: &Address) -> MuxResult<usize> {
        let fd = check_open(h)?;
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
                addr.as_sockaddr(),
                addr.len(),
            )
        };
        if n < 0 {
            Err(MuxError::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn recv_from(&self, h: &Rc<Descriptor>, buf: &mut [u8]) -> MuxResult<(usize, Address)> {
        let fd = check_open(h)?;
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            return Err(MuxError::last_os_error());
        }
        Ok((n as usize, Address::from_storage(storage, len)))
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

    pub fn async_read(&self, h: &Rc<Descriptor>, buf: Buffer, handler: IoHandler) {
        self.mux.submit(h, Operation::read(buf, handler));
    }

    pub fn async_write(&self, h: &Rc<Descriptor>, buf: Buffer, handler: IoHandler) {
        self.mux.submit(h, Operation::write(buf, handler));
    }

    pub fn async_send_to(&self, h: &Rc<Descriptor>, buf: Buffer, addr: Address, handler: IoHandler) {
        self.mux.submit(h, Operation::send_to(buf, addr, handler));
    }

    pub fn async_recv_from(&self, h: &Rc<Descriptor>, buf: Buffer, handler: RecvFromHandler) {
        self.mux.submit(h, Operation::recv_from(buf, handler));
    }
}
