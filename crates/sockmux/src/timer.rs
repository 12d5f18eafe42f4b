//! One-shot timers over timerfd.
//!
//! A [`Timer`] is an external collaborator of the multiplexer: it wraps a
//! timerfd handle and speaks the same operation/queue protocol as the
//! socket services. Arming writes the expiry; [`Timer::fire`] queues a
//! read-class operation that completes when the timerfd becomes readable.
//! I/O timeouts are composed by racing a timer against the operation; the
//! multiplexer has no built-in per-operation timeout.

use std::mem;
use std::rc::Rc;
use std::time::{Duration, Instant};

use sockmux_core::{MuxError, MuxResult};

use crate::descriptor::Descriptor;
use crate::mux::Multiplexer;
use crate::op::{ConnectHandler, Operation};

#[derive(Clone)]
pub struct TimerService {
    mux: Rc<Multiplexer>,
}

impl TimerService {
    pub(crate) fn new(mux: Rc<Multiplexer>) -> Self {
        Self { mux }
    }

    pub fn timer(&self) -> MuxResult<Timer> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(MuxError::last_os_error());
        }
        Ok(Timer {
            mux: self.mux.clone(),
            desc: Rc::new(Descriptor::from_fd(fd)),
        })
    }
}

/// Single-shot timer. After the armed expiry has been delivered the native
/// handle is released; create a new timer to wait again.
pub struct Timer {
    mux: Rc<Multiplexer>,
    desc: Rc<Descriptor>,
}

impl Timer {
    /// Arm the timer `d` from now. A zero duration is rounded up to the
    /// smallest representable expiry, since an all-zero `it_value` would
    /// disarm the timerfd instead.
    pub fn expires_after(&self, d: Duration) -> MuxResult<()> {
        let fd = self.desc.fd();
        if fd < 0 {
            return Err(MuxError::BadDescriptor);
        }
        let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
        spec.it_value.tv_sec = d.as_secs() as libc::time_t;
        spec.it_value.tv_nsec = d.subsec_nanos() as libc::c_long;
        if spec.it_value.tv_sec == 0 && spec.it_value.tv_nsec == 0 {
            spec.it_value.tv_nsec = 1;
        }
        let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(MuxError::last_os_error());
        }
        Ok(())
    }

    pub fn expires_at(&self, at: Instant) -> MuxResult<()> {
        self.expires_after(at.saturating_duration_since(Instant::now()))
    }

    /// Queue the expiry wait. The handler runs once on the driving thread:
    /// `Ok(())` after the armed expiry, `Err(Canceled)` after [`Timer::cancel`].
    /// The handle is released before the handler is invoked.
    pub fn fire(&self, handler: ConnectHandler) {
        let mux = self.mux.clone();
        let desc = self.desc.clone();
        let wrapped: ConnectHandler = Box::new(move |result| {
            mux.drain(&desc, MuxError::Canceled);
            handler(result);
        });
        self.mux.submit(&self.desc, Operation::timer_fire(wrapped));
    }

    /// Abandon the wait: a queued `fire` handler completes with `Canceled`
    /// and the native handle is released.
    pub fn cancel(&self) {
        self.mux.drain(&self.desc, MuxError::Canceled);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if self.desc.is_open() {
            self.mux.drain(&self.desc, MuxError::Canceled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_armed_timerfd_becomes_readable() {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        assert!(fd >= 0);
        let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
        spec.it_value.tv_nsec = 1_000_000; // 1ms
        assert_eq!(
            unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) },
            0
        );
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 1000) };
        assert_eq!(rc, 1);
        let mut ticks: u64 = 0;
        let n = unsafe {
            libc::read(
                fd,
                &mut ticks as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, 8);
        assert_eq!(ticks, 1);
        unsafe { libc::close(fd) };
    }
}
