//! Deferred asynchronous operations.
//!
//! An [`Operation`] is one unit of queued work: a tagged kind (connect,
//! read, write, accept, datagram send/recv, timer fire) plus a single-shot
//! completion handler. Operations live boxed inside their descriptor's
//! class queue and are consumed exactly once, either by normal completion
//! or by a drain.
//!
//! The two multiplexer models drive an operation differently:
//!
//! - readiness: [`Operation::request`] initiates (only connect needs a
//!   native call), [`Operation::try_complete`] attempts the real transfer
//!   when the OS reports readiness — `false` means "not ready, wait for the
//!   next notification".
//! - completion: [`Operation::build_sqe`] emits the io_uring submission;
//!   the CQE result is pushed in with [`Operation::set_result`] and the
//!   is-complete predicate is trivially true.

use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use sockmux_core::{Buffer, MuxError, MuxResult};

use crate::addr::Address;
use crate::descriptor::Descriptor;

/// Queue class index: read-class or write-class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    In = 0,
    Out = 1,
}

pub type IoHandler = Box<dyn FnOnce(MuxResult<usize>)>;
pub type ConnectHandler = Box<dyn FnOnce(MuxResult<()>)>;
pub type AcceptHandler = Box<dyn FnOnce(MuxResult<(Rc<Descriptor>, Address)>)>;
pub type RecvFromHandler = Box<dyn FnOnce(MuxResult<(usize, Address)>)>;

pub(crate) enum OpKind {
    Connect {
        addr: Address,
        handler: ConnectHandler,
    },
    Read {
        buf: Buffer,
        handler: IoHandler,
    },
    Write {
        buf: Buffer,
        handler: IoHandler,
    },
    Accept {
        storage: libc::sockaddr_storage,
        socklen: libc::socklen_t,
        handler: AcceptHandler,
    },
    RecvFrom {
        buf: Buffer,
        storage: libc::sockaddr_storage,
        socklen: libc::socklen_t,
        handler: RecvFromHandler,
    },
    SendTo {
        buf: Buffer,
        addr: Address,
        handler: IoHandler,
    },
    TimerFire {
        // Owned by the operation so the kernel-side read target stays
        // valid until the operation itself is released.
        tick: u64,
        handler: ConnectHandler,
    },
}

/// io_uring needs stable msghdr/iovec storage for sendmsg/recvmsg.
#[cfg(feature = "uring")]
pub(crate) struct Scratch {
    msg: libc::msghdr,
    iov: libc::iovec,
}

#[cfg(feature = "uring")]
impl Scratch {
    fn zeroed() -> Self {
        Self {
            msg: unsafe { mem::zeroed() },
            iov: unsafe { mem::zeroed() },
        }
    }
}

pub(crate) struct Operation {
    kind: OpKind,
    result: MuxResult<usize>,
    requested: bool,
    #[cfg(feature = "uring")]
    scratch: Scratch,
}

enum Attempt {
    Done(MuxResult<usize>),
    Again,
}

fn attempt_io(n: isize) -> Attempt {
    if n >= 0 {
        return Attempt::Done(Ok(n as usize));
    }
    let err = MuxError::last_os_error();
    if err.is_would_block() {
        Attempt::Again
    } else {
        Attempt::Done(Err(err))
    }
}

impl Operation {
    fn new(kind: OpKind) -> Self {
        Self {
            kind,
            result: Err(MuxError::WouldBlock),
            requested: false,
            #[cfg(feature = "uring")]
            scratch: Scratch::zeroed(),
        }
    }

    pub(crate) fn connect(addr: Address, handler: ConnectHandler) -> Self {
        Self::new(OpKind::Connect { addr, handler })
    }

    pub(crate) fn read(buf: Buffer, handler: IoHandler) -> Self {
        Self::new(OpKind::Read { buf, handler })
    }

    pub(crate) fn write(buf: Buffer, handler: IoHandler) -> Self {
        Self::new(OpKind::Write { buf, handler })
    }

    pub(crate) fn accept(handler: AcceptHandler) -> Self {
        Self::new(OpKind::Accept {
            storage: unsafe { mem::zeroed() },
            socklen: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            handler,
        })
    }

    pub(crate) fn recv_from(buf: Buffer, handler: RecvFromHandler) -> Self {
        Self::new(OpKind::RecvFrom {
            buf,
            storage: unsafe { mem::zeroed() },
            socklen: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            handler,
        })
    }

    pub(crate) fn send_to(buf: Buffer, addr: Address, handler: IoHandler) -> Self {
        Self::new(OpKind::SendTo { buf, addr, handler })
    }

    pub(crate) fn timer_fire(handler: ConnectHandler) -> Self {
        Self::new(OpKind::TimerFire { tick: 0, handler })
    }

    pub(crate) fn class(&self) -> OpClass {
        match self.kind {
            OpKind::Read { .. }
            | OpKind::Accept { .. }
            | OpKind::RecvFrom { .. }
            | OpKind::TimerFire { .. } => OpClass::In,
            OpKind::Connect { .. } | OpKind::Write { .. } | OpKind::SendTo { .. } => OpClass::Out,
        }
    }

    pub(crate) fn set_result(&mut self, result: MuxResult<usize>) {
        self.result = result;
    }

    /// Readiness-model initiation for a head operation. Only connect needs
    /// a native call here; everything else waits for a notification.
    /// Idempotent: dispatch may re-kick a head that was already initiated.
    pub(crate) fn request(&mut self, fd: RawFd) -> MuxResult<()> {
        if self.requested {
            return Ok(());
        }
        self.requested = true;
        match &self.kind {
            OpKind::Connect { addr, .. } => {
                let rc = unsafe { libc::connect(fd, addr.as_sockaddr(), addr.len()) };
                if rc == 0 {
                    return Ok(());
                }
                let err = MuxError::last_os_error();
                if err.is_would_block() {
                    // EINPROGRESS: completion is reported as writability
                    Ok(())
                } else {
                    Err(err)
                }
            }
            _ => Ok(()),
        }
    }

    /// Readiness-model completion attempt: perform the native transfer and
    /// record the outcome. Returns `false` when the call is still not
    /// ready, leaving the operation at the head of its queue.
    pub(crate) fn try_complete(&mut self, fd: RawFd) -> bool {
        let attempt = match &mut self.kind {
            OpKind::Connect { .. } => {
                let mut err: libc::c_int = 0;
                let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut err as *mut _ as *mut libc::c_void,
                        &mut len,
                    )
                };
                if rc != 0 {
                    Attempt::Done(Err(MuxError::last_os_error()))
                } else if err == 0 {
                    Attempt::Done(Ok(0))
                } else {
                    Attempt::Done(Err(MuxError::from_errno(err)))
                }
            }
            OpKind::Read { buf, .. } => {
                let n = unsafe {
                    libc::recv(fd, buf.ptr() as *mut libc::c_void, buf.len(), 0)
                };
                attempt_io(n)
            }
            OpKind::Write { buf, .. } => {
                let n = unsafe {
                    libc::send(
                        fd,
                        buf.ptr() as *const libc::c_void,
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                attempt_io(n)
            }
            OpKind::Accept { storage, socklen, .. } => {
                *socklen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                let rc = unsafe {
                    libc::accept(fd, storage as *mut _ as *mut libc::sockaddr, socklen)
                };
                attempt_io(rc as isize)
            }
            OpKind::RecvFrom { buf, storage, socklen, .. } => {
                *socklen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                let n = unsafe {
                    libc::recvfrom(
                        fd,
                        buf.ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                        storage as *mut _ as *mut libc::sockaddr,
                        socklen,
                    )
                };
                attempt_io(n)
            }
            OpKind::SendTo { buf, addr, .. } => {
                let n = unsafe {
                    libc::sendto(
                        fd,
                        buf.ptr() as *const libc::c_void,
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                        addr.as_sockaddr(),
                        addr.len(),
                    )
                };
                attempt_io(n)
            }
            OpKind::TimerFire { tick, .. } => {
                let n = unsafe {
                    libc::read(
                        fd,
                        tick as *mut u64 as *mut libc::c_void,
                        mem::size_of::<u64>(),
                    )
                };
                attempt_io(n)
            }
        };
        match attempt {
            Attempt::Done(result) => {
                self.result = result;
                true
            }
            Attempt::Again => false,
        }
    }

    /// Build the completion-model submission entry. Pointers handed to the
    /// kernel live inside this boxed operation (or in caller-owned buffer
    /// memory) and stay valid until the matching CQE is reaped.
    #[cfg(feature = "uring")]
    pub(crate) fn build_sqe(&mut self, fd: RawFd, token: u64) -> io_uring::squeue::Entry {
        use io_uring::{opcode, types};

        let Self { kind, scratch, .. } = self;
        let fd = types::Fd(fd);
        let sqe = match kind {
            OpKind::Connect { addr, .. } => {
                opcode::Connect::new(fd, addr.as_sockaddr(), addr.len()).build()
            }
            OpKind::Read { buf, .. } => {
                opcode::Recv::new(fd, buf.ptr(), buf.len() as u32).build()
            }
            OpKind::Write { buf, .. } => {
                opcode::Send::new(fd, buf.ptr() as *const u8, buf.len() as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
            }
            OpKind::Accept { storage, socklen, .. } => {
                *socklen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                opcode::Accept::new(
                    fd,
                    storage as *mut _ as *mut libc::sockaddr,
                    socklen as *mut libc::socklen_t,
                )
                .flags(libc::SOCK_CLOEXEC)
                .build()
            }
            OpKind::RecvFrom { buf, storage, socklen, .. } => {
                *socklen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                scratch.iov = libc::iovec {
                    iov_base: buf.ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                };
                scratch.msg = unsafe { mem::zeroed() };
                scratch.msg.msg_name = storage as *mut _ as *mut libc::c_void;
                scratch.msg.msg_namelen = *socklen;
                scratch.msg.msg_iov = &mut scratch.iov;
                scratch.msg.msg_iovlen = 1;
                opcode::RecvMsg::new(fd, &mut scratch.msg).build()
            }
            OpKind::SendTo { buf, addr, .. } => {
                scratch.iov = libc::iovec {
                    iov_base: buf.ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                };
                scratch.msg = unsafe { mem::zeroed() };
                scratch.msg.msg_name = addr.as_sockaddr() as *mut libc::c_void;
                scratch.msg.msg_namelen = addr.len();
                scratch.msg.msg_iov = &mut scratch.iov;
                scratch.msg.msg_iovlen = 1;
                opcode::SendMsg::new(fd, &scratch.msg).build()
            }
            OpKind::TimerFire { tick, .. } => {
                opcode::Read::new(fd, tick as *mut u64 as *mut u8, mem::size_of::<u64>() as u32)
                    .build()
            }
        };
        sqe.user_data(token)
    }

    /// Copy kernel-written lengths out of the scratch area after a CQE.
    #[cfg(feature = "uring")]
    pub(crate) fn absorb_cqe(&mut self) {
        if let OpKind::RecvFrom { socklen, .. } = &mut self.kind {
            *socklen = self.scratch.msg.msg_namelen;
        }
    }

    /// Consume the operation: invoke its handler exactly once with the
    /// recorded result.
    pub(crate) fn finish(self: Box<Self>) {
        let me = *self;
        let result = me.result;
        match me.kind {
            OpKind::Connect { handler, .. } => handler(result.map(|_| ())),
            OpKind::Read { handler, .. }
            | OpKind::Write { handler, .. }
            | OpKind::SendTo { handler, .. } => handler(result),
            OpKind::Accept { storage, socklen, handler } => match result {
                Ok(fd) => handler(Ok((
                    Rc::new(Descriptor::from_fd(fd as RawFd)),
                    Address::from_storage(storage, socklen),
                ))),
                Err(e) => handler(Err(e)),
            },
            OpKind::RecvFrom { storage, socklen, handler, .. } => match result {
                Ok(n) => handler(Ok((n, Address::from_storage(storage, socklen)))),
                Err(e) => handler(Err(e)),
            },
            OpKind::TimerFire { handler, .. } => handler(result.map(|_| ())),
        }
    }
}
