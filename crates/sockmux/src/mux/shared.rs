//! Cross-thread submission state shared between the driving thread and
//! [`Poster`] handles on other threads.
//!
//! This is the only synchronization point in the engine: a lock-free MPSC
//! queue of posted tasks plus the eventfd wake source and the active-link
//! counter. Everything else mutates on the driving thread only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use sockmux_core::MuxResult;

use super::wake::WakeFd;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Shared {
    pending: SegQueue<Task>,
    wake: WakeFd,
    // Outstanding asynchronous work not tied to a registered descriptor:
    // posted-but-unexecuted tasks plus caller-managed links.
    links: AtomicUsize,
}

impl Shared {
    pub(crate) fn new() -> MuxResult<Self> {
        Ok(Self {
            pending: SegQueue::new(),
            wake: WakeFd::create()?,
            links: AtomicUsize::new(0),
        })
    }

    pub(crate) fn wake_fd(&self) -> std::os::unix::io::RawFd {
        self.wake.fd()
    }

    pub(crate) fn wake_drain(&self) {
        self.wake.drain();
    }

    pub(crate) fn add_link(&self) {
        self.links.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_link(&self) {
        self.links.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn links(&self) -> usize {
        self.links.load(Ordering::Acquire)
    }

    /// Queue a task and wake the driving thread. The link is held until
    /// the task has executed, so `run()` cannot idle-exit past it.
    pub(crate) fn push(&self, task: Task) {
        self.add_link();
        self.pending.push(task);
        self.wake.notify();
    }

    /// Execute every task visible at entry, in submission order, on the
    /// calling (driving) thread. Tasks pushed while draining are picked up
    /// by the next wake.
    pub(crate) fn drain_pending(&self) -> usize {
        let visible = self.pending.len();
        let mut executed = 0;
        for _ in 0..visible {
            match self.pending.pop() {
                Some(task) => {
                    task();
                    self.release_link();
                    executed += 1;
                }
                None => break,
            }
        }
        executed
    }
}

/// Cloneable, `Send` handle for submitting work to the driving thread from
/// anywhere else.
#[derive(Clone)]
pub struct Poster {
    shared: Arc<Shared>,
}

impl Poster {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn post<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.shared.push(Box::new(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_pending_runs_in_submission_order() {
        let shared = Shared::new().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..4 {
            let seen = seen.clone();
            shared.push(Box::new(move || seen.lock().unwrap().push(i)));
        }
        assert_eq!(shared.links(), 4);
        assert_eq!(shared.drain_pending(), 4);
        assert_eq!(shared.links(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_poster_is_send() {
        let shared = Arc::new(Shared::new().unwrap());
        let poster = Poster::new(shared.clone());
        let hits = Arc::new(AtomicU32::new(0));
        let h2 = hits.clone();
        std::thread::spawn(move || {
            poster.post(move || {
                h2.fetch_add(1, Ordering::SeqCst);
            });
        })
        .join()
        .unwrap();
        shared.drain_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
