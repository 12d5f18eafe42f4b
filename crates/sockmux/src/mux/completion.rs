//! Completion-based multiplexer over io_uring.
//!
//! Submitting the head of a class queue hands its pointers to the kernel;
//! the matching CQE later carries the status and byte count. Because the
//! kernel owns those pointers until the CQE is reaped, a close cannot free
//! the operation immediately: the descriptor enters a closing window,
//! in-flight requests get a best-effort `AsyncCancel`, and the native
//! handle is released only after the last CQE lands.
//!
//! Completion tokens are monotonic and never reused, so a stale CQE can
//! never be matched to a newer operation.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use io_uring::{opcode, types, IoUring, SubmissionQueue};

use sockmux_core::{kdebug, ktrace, kwarn, MuxError, MuxResult};

use super::shared::{Poster, Shared};
use crate::descriptor::Descriptor;
use crate::op::{OpClass, Operation};

const RING_ENTRIES: u32 = 256;
// Reserved user_data values; operation tokens count up from zero and can
// never collide with these.
const WAKE_TOKEN: u64 = u64::MAX;
const CANCEL_TOKEN: u64 = u64::MAX - 1;

type LocalTask = Box<dyn FnOnce()>;

pub struct CompletionMux {
    ring: RefCell<IoUring>,
    shared: Arc<Shared>,
    active: RefCell<HashMap<RawFd, Rc<Descriptor>>>,
    // token -> owner of the in-flight request
    inflight: RefCell<HashMap<u64, (Rc<Descriptor>, OpClass)>>,
    next_token: Cell<u64>,
    local: RefCell<VecDeque<LocalTask>>,
}

impl CompletionMux {
    pub fn new() -> MuxResult<Self> {
        let ring = IoUring::new(RING_ENTRIES).map_err(|e| from_io(&e))?;
        let shared = Arc::new(Shared::new()?);
        let mux = Self {
            ring: RefCell::new(ring),
            shared,
            active: RefCell::new(HashMap::new()),
            inflight: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
            local: RefCell::new(VecDeque::new()),
        };
        mux.arm_wake()?;
        Ok(mux)
    }

    /// `Send` handle for submitting work from other threads.
    pub fn poster(&self) -> Poster {
        Poster::new(self.shared.clone())
    }

    /// Queue a task for execution on the driving thread. Holds an active
    /// link until executed, so `run()` cannot idle-exit past it.
    pub fn post<F: FnOnce() + 'static>(&self, f: F) {
        self.shared.add_link();
        self.local.borrow_mut().push_back(Box::new(f));
    }

    pub fn add_active_link(&self) {
        self.shared.add_link();
    }

    pub fn release_active_link(&self) {
        self.shared.release_link();
    }

    /// Track a descriptor in the active set. There is no kernel-side
    /// registration in this model; membership only keeps `run()` alive.
    pub fn bind(&self, desc: &Rc<Descriptor>, _mask: u8) -> MuxResult<()> {
        let fd = desc.fd();
        if fd < 0 {
            return Err(MuxError::BadDescriptor);
        }
        self.active
            .borrow_mut()
            .entry(fd)
            .or_insert_with(|| desc.clone());
        Ok(())
    }

    pub fn unbind(&self, desc: &Rc<Descriptor>) {
        let fd = desc.fd();
        if fd >= 0 {
            self.active.borrow_mut().remove(&fd);
        }
    }

    /// Enqueue an operation; hand it to the kernel if it became the head
    /// of its class queue.
    pub(crate) fn submit(&self, desc: &Rc<Descriptor>, op: Operation) {
        if !desc.is_open() || desc.is_closing() {
            let mut op = Box::new(op);
            op.set_result(Err(MuxError::BadDescriptor));
            self.post(move || op.finish());
            return;
        }
        let class = op.class();
        if desc.enqueue(Box::new(op)) {
            self.submit_head(desc, class);
        }
    }

    /// Build and push the head operation's submission entry. The operation
    /// stays boxed at the head of its queue, so the pointers baked into the
    /// entry remain stable until the CQE is reaped.
    fn submit_head(&self, desc: &Rc<Descriptor>, class: OpClass) {
        let fd = desc.fd();
        let token = self.next_token.get();
        self.next_token.set(token + 1);

        let sqe = match desc.with_head_mut(class, |op| op.build_sqe(fd, token)) {
            Some(sqe) => sqe,
            None => return,
        };

        let mut ring = self.ring.borrow_mut();
        if let Err(e) = push_sqe(&mut ring, &sqe) {
            drop(ring);
            if let Some(mut op) = desc.pop_head(class) {
                op.set_result(Err(e));
                self.post(move || op.finish());
            }
            return;
        }
        drop(ring);

        desc.set_submitted(class, true);
        self.inflight
            .borrow_mut()
            .insert(token, (desc.clone(), class));
        self.active
            .borrow_mut()
            .entry(fd)
            .or_insert_with(|| desc.clone());
    }

    /// Force-complete all queued work with a fixed error. Operations whose
    /// native request is in flight stay queued; the descriptor enters the
    /// closing window and is released when the last CQE lands.
    pub fn drain(&self, desc: &Rc<Descriptor>, err: MuxError) {
        if desc.is_closing() {
            return;
        }
        let ops = desc.take_unsubmitted();
        if !ops.is_empty() {
            kdebug!("mux: drain fd={} ops={} err={}", desc.fd(), ops.len(), err);
            self.post(move || {
                for mut op in ops {
                    op.set_result(Err(err));
                    op.finish();
                }
            });
        }
        if desc.has_submitted() {
            desc.set_closing();
            self.cancel_inflight(desc);
        } else {
            self.release(desc);
        }
    }

    /// Best-effort cancellation of every in-flight request on `desc`. The
    /// CQEs still arrive (typically with `ECANCELED`) and drive the release.
    fn cancel_inflight(&self, desc: &Rc<Descriptor>) {
        let tokens: Vec<u64> = self
            .inflight
            .borrow()
            .iter()
            .filter(|(_, (d, _))| Rc::ptr_eq(d, desc))
            .map(|(t, _)| *t)
            .collect();
        let mut ring = self.ring.borrow_mut();
        for token in tokens {
            let sqe = opcode::AsyncCancel::new(token)
                .build()
                .user_data(CANCEL_TOKEN);
            if let Err(e) = push_sqe(&mut ring, &sqe) {
                ktrace!("mux: cancel push failed: {}", e);
            }
        }
    }

    /// Final release: close the native handle and leave the active set.
    fn release(&self, desc: &Rc<Descriptor>) {
        let fd = desc.invalidate();
        if fd >= 0 {
            self.active.borrow_mut().remove(&fd);
            unsafe { libc::close(fd) };
        }
    }

    /// Block until the active set, the in-flight table, and the link
    /// counter are all empty.
    pub fn run(&self) {
        while !self.idle() {
            self.run_once(None);
        }
    }

    /// One submit-and-reap cycle. `None` blocks indefinitely. Returns the
    /// number of tasks and operation completions processed.
    pub fn run_once(&self, timeout: Option<Duration>) -> usize {
        let mut processed = self.run_local();

        // Never park while locally queued work is pending, and never park
        // after making progress: the caller's idle check must get a chance
        // to observe it.
        self.wait(if processed > 0 || !self.local.borrow().is_empty() {
            Some(Duration::ZERO)
        } else {
            timeout
        });

        // Reap first, then dispatch: handlers may re-enter submit, which
        // needs the ring borrow.
        let reaped: Vec<(u64, i32)> = {
            let mut ring = self.ring.borrow_mut();
            ring.completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect()
        };

        for (token, res) in reaped {
            match token {
                WAKE_TOKEN => {
                    self.shared.wake_drain();
                    processed += self.shared.drain_pending();
                    if let Err(e) = self.arm_wake() {
                        kwarn!("mux: wake re-arm failed: {}", e);
                    }
                }
                CANCEL_TOKEN => {}
                _ => processed += self.dispatch(token, res),
            }
        }

        processed += self.run_local();
        processed
    }

    fn idle(&self) -> bool {
        self.active.borrow().is_empty()
            && self.inflight.borrow().is_empty()
            && self.shared.links() == 0
    }

    /// Flush submissions and wait for at least one completion, bounded by
    /// `timeout`. Timeout expiry and signal interruption are not errors.
    fn wait(&self, timeout: Option<Duration>) {
        let mut ring = self.ring.borrow_mut();
        let result = match timeout {
            None => ring.submit_and_wait(1),
            Some(d) if d.is_zero() => ring.submit(),
            Some(d) => {
                let ts = types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                ring.submitter().submit_with_args(1, &args)
            }
        };
        if let Err(e) = result {
            match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                _ => kwarn!("mux: ring submit: {}", from_io(&e)),
            }
        }
    }

    /// Execute locally posted tasks. Snapshots the queue length so a task
    /// that posts again cannot starve the event wait.
    fn run_local(&self) -> usize {
        let visible = self.local.borrow().len();
        let mut executed = 0;
        for _ in 0..visible {
            let task = self.local.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    self.shared.release_link();
                    executed += 1;
                }
                None => break,
            }
        }
        executed
    }

    /// Match one CQE to its operation and deliver the completion.
    fn dispatch(&self, token: u64, res: i32) -> usize {
        let (desc, class) = match self.inflight.borrow_mut().remove(&token) {
            Some(entry) => entry,
            // token from a request whose owner is already gone
            None => return 0,
        };
        desc.set_submitted(class, false);

        let result = if res < 0 {
            Err(MuxError::from_errno(-res))
        } else {
            Ok(res as usize)
        };

        let handled = match desc.pop_head(class) {
            Some(mut op) => {
                op.set_result(result);
                op.absorb_cqe();
                op.finish();
                1
            }
            None => 0,
        };

        if desc.is_closing() {
            if !desc.has_submitted() {
                self.release(&desc);
            }
        } else if !desc.is_empty(class) && !desc.is_submitted(class) {
            // single-operation pipelining; a head the handler just
            // submitted is skipped
            self.submit_head(&desc, class);
        }
        handled
    }

    /// Arm (or re-arm) the one-shot poll on the wake eventfd.
    fn arm_wake(&self) -> MuxResult<()> {
        let sqe = opcode::PollAdd::new(
            types::Fd(self.shared.wake_fd()),
            libc::POLLIN as u32,
        )
        .build()
        .user_data(WAKE_TOKEN);
        let mut ring = self.ring.borrow_mut();
        push_sqe(&mut ring, &sqe)
    }
}

fn push_sqe(ring: &mut IoUring, sqe: &io_uring::squeue::Entry) -> MuxResult<()> {
    fn try_push(sq: &mut SubmissionQueue<'_>, sqe: &io_uring::squeue::Entry) -> bool {
        unsafe { sq.push(sqe).is_ok() }
    }
    if try_push(&mut ring.submission(), sqe) {
        return Ok(());
    }
    // queue full: flush to the kernel and retry once
    ring.submit().map_err(|e| from_io(&e))?;
    if try_push(&mut ring.submission(), sqe) {
        Ok(())
    } else {
        Err(MuxError::Unexpected(libc::EBUSY))
    }
}

fn from_io(e: &std::io::Error) -> MuxError {
    MuxError::from_errno(e.raw_os_error().unwrap_or(libc::EIO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_returns_when_idle() {
        let mux = CompletionMux::new().unwrap();
        mux.run();
    }

    #[test]
    fn test_local_post_executes_before_exit() {
        let mux = CompletionMux::new().unwrap();
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        mux.post(move || h.set(true));
        mux.run();
        assert!(hit.get());
    }

    #[test]
    fn test_poster_wakes_the_ring() {
        let mux = CompletionMux::new().unwrap();
        let poster = mux.poster();
        let hit = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let h = hit.clone();
        std::thread::spawn(move || {
            poster.post(move || h.store(true, std::sync::atomic::Ordering::SeqCst));
        })
        .join()
        .unwrap();
        mux.run_once(Some(Duration::from_millis(1000)));
        assert!(hit.load(std::sync::atomic::Ordering::SeqCst));
    }
}
