//! Eventfd wake primitive for cross-thread submission.
//!
//! Counter semantics coalesce wakes: any number of `notify()` calls before
//! the driving thread reads the fd collapse into a single notification.

use std::os::unix::io::RawFd;

use sockmux_core::{MuxError, MuxResult};

pub(crate) struct WakeFd {
    fd: RawFd,
}

impl WakeFd {
    pub(crate) fn create() -> MuxResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(MuxError::last_os_error());
        }
        Ok(Self { fd })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter would overflow, so a wake is already
        // pending and nothing is lost.
        let _ = ret;
    }

    /// Reset the counter after a wake was observed.
    pub(crate) fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_then_drain() {
        let w = WakeFd::create().unwrap();
        w.notify();
        w.notify();
        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(
                w.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, 8);
        // coalesced counter
        assert_eq!(val, 2);
    }
}
