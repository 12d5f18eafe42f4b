//! Socket services: the user-facing surface over descriptors.
//!
//! A service borrows the multiplexer (`Rc`, non-owning in the cycle sense)
//! and pairs a synchronous call set with an asynchronous one. Synchronous
//! calls are plain native calls on the handle; asynchronous calls allocate
//! an [`Operation`](crate::op) and enqueue it on the proper class queue.

pub mod option;
pub mod tcp;
pub mod udp;

pub use option::{NonBlock, RecvBufSize, ReuseAddr, SocketOption, TcpNoDelay};
pub use tcp::TcpService;
pub use udp::UdpService;

use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use sockmux_core::{MuxError, MuxResult};

use crate::addr::Address;
use crate::descriptor::Descriptor;

/// Direction argument for [`TcpService::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

impl Shutdown {
    fn how(self) -> libc::c_int {
        match self {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        }
    }
}

pub(crate) fn open_socket(family: libc::c_int, kind: libc::c_int) -> MuxResult<Rc<Descriptor>> {
    let fd = unsafe { libc::socket(family, kind | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(MuxError::last_os_error());
    }
    Ok(Rc::new(Descriptor::from_fd(fd)))
}

pub(crate) fn check_open(h: &Descriptor) -> MuxResult<RawFd> {
    let fd = h.fd();
    if fd < 0 {
        Err(MuxError::BadDescriptor)
    } else {
        Ok(fd)
    }
}

pub(crate) fn checked(rc: libc::c_int) -> MuxResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(MuxError::last_os_error())
    }
}

pub(crate) fn sock_bind(h: &Descriptor, addr: &Address) -> MuxResult<()> {
    let fd = check_open(h)?;
    checked(unsafe { libc::bind(fd, addr.as_sockaddr(), addr.len()) })
}

/// Synchronous connect. `EINPROGRESS` on a non-blocking socket counts as
/// success; the caller observes the outcome through writability.
pub(crate) fn sock_connect(h: &Descriptor, addr: &Address) -> MuxResult<()> {
    let fd = check_open(h)?;
    let rc = unsafe { libc::connect(fd, addr.as_sockaddr(), addr.len()) };
    if rc == 0 {
        return Ok(());
    }
    let err = MuxError::last_os_error();
    if err.is_would_block() {
        Ok(())
    } else {
        Err(err)
    }
}

pub(crate) fn sock_read(h: &Descriptor, buf: &mut [u8]) -> MuxResult<usize> {
    let fd = check_open(h)?;
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        Err(MuxError::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn sock_write(h: &Descriptor, buf: &[u8]) -> MuxResult<usize> {
    let fd = check_open(h)?;
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        Err(MuxError::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn sock_local(h: &Descriptor) -> MuxResult<Address> {
    let fd = check_open(h)?;
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    checked(unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    Ok(Address::from_storage(storage, len))
}

pub(crate) fn sock_remote(h: &Descriptor) -> MuxResult<Address> {
    let fd = check_open(h)?;
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    checked(unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    Ok(Address::from_storage(storage, len))
}

pub(crate) fn sock_nonblocking(h: &Descriptor, on: bool) -> MuxResult<()> {
    let fd = check_open(h)?;
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(MuxError::last_os_error());
    }
    let flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    checked(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })
}
