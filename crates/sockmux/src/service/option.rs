//! Typed socket options over `setsockopt`/`getsockopt`.

use std::mem;
use std::os::unix::io::RawFd;

use sockmux_core::{MuxError, MuxResult};

pub trait SocketOption: Sized {
    fn set(&self, fd: RawFd) -> MuxResult<()>;
    fn get(fd: RawFd) -> MuxResult<Self>;
}

fn set_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> MuxResult<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(MuxError::last_os_error());
    }
    Ok(())
}

fn get_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> MuxResult<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(MuxError::last_os_error());
    }
    Ok(value)
}

/// `SO_REUSEADDR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReuseAddr(pub bool);

impl SocketOption for ReuseAddr {
    fn set(&self, fd: RawFd) -> MuxResult<()> {
        set_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, self.0 as libc::c_int)
    }

    fn get(fd: RawFd) -> MuxResult<Self> {
        Ok(Self(get_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)? != 0))
    }
}

/// `TCP_NODELAY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpNoDelay(pub bool);

impl SocketOption for TcpNoDelay {
    fn set(&self, fd: RawFd) -> MuxResult<()> {
        set_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, self.0 as libc::c_int)
    }

    fn get(fd: RawFd) -> MuxResult<Self> {
        Ok(Self(get_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY)? != 0))
    }
}

/// `SO_RCVBUF`. The kernel may round the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvBufSize(pub libc::c_int);

impl SocketOption for RecvBufSize {
    fn set(&self, fd: RawFd) -> MuxResult<()> {
        set_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, self.0)
    }

    fn get(fd: RawFd) -> MuxResult<Self> {
        Ok(Self(get_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF)?))
    }
}

/// `O_NONBLOCK`, read and written through `fcntl` rather than sockopts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonBlock(pub bool);

impl SocketOption for NonBlock {
    fn set(&self, fd: RawFd) -> MuxResult<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(MuxError::last_os_error());
        }
        let flags = if self.0 {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } != 0 {
            return Err(MuxError::last_os_error());
        }
        Ok(())
    }

    fn get(fd: RawFd) -> MuxResult<Self> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(MuxError::last_os_error());
        }
        Ok(Self(flags & libc::O_NONBLOCK != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_fd() -> RawFd {
        unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) }
    }

    #[test]
    fn test_reuse_addr_roundtrip() {
        let fd = tcp_fd();
        assert!(fd >= 0);
        ReuseAddr(true).set(fd).unwrap();
        assert_eq!(ReuseAddr::get(fd).unwrap(), ReuseAddr(true));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_nonblock_via_fcntl() {
        let fd = tcp_fd();
        assert!(fd >= 0);
        assert_eq!(NonBlock::get(fd).unwrap(), NonBlock(false));
        NonBlock(true).set(fd).unwrap();
        assert_eq!(NonBlock::get(fd).unwrap(), NonBlock(true));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_option_on_closed_fd_fails() {
        assert!(TcpNoDelay(true).set(-1).is_err());
    }
}
