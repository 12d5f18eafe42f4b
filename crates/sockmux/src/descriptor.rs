//! Descriptor: one native OS handle plus its pending-operation queues.
//!
//! A `Descriptor` is shared as `Rc<Descriptor>` between the multiplexer's
//! registration set, the owning caller, and any in-flight callback — the
//! last co-owner to let go releases it. Operations are owned by the class
//! queues and never outlive them; there is no back-pointer from an
//! operation to its descriptor.
//!
//! Registration interest is always derived from queue state via
//! [`Descriptor::interest`], never stored separately.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use crate::op::{OpClass, Operation};

pub const INVALID_FD: RawFd = -1;

/// Poll-interest bit for the read class.
pub const MASK_IN: u8 = 0b01;
/// Poll-interest bit for the write class.
pub const MASK_OUT: u8 = 0b10;

pub struct Descriptor {
    fd: Cell<RawFd>,
    queues: [RefCell<VecDeque<Box<Operation>>>; 2],
    // Completion-model bookkeeping: per class, whether the head operation's
    // native request has reached the kernel; `closing` marks the deferred
    // release window between close and the final completion notification.
    submitted: [Cell<bool>; 2],
    closing: Cell<bool>,
}

impl Descriptor {
    pub(crate) fn from_fd(fd: RawFd) -> Self {
        Self {
            fd: Cell::new(fd),
            queues: [RefCell::new(VecDeque::new()), RefCell::new(VecDeque::new())],
            submitted: [Cell::new(false), Cell::new(false)],
            closing: Cell::new(false),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.fd.get() != INVALID_FD
    }

    /// Mark the handle invalid and hand the old fd to the caller, who is
    /// responsible for the native close.
    pub(crate) fn invalidate(&self) -> RawFd {
        self.fd.replace(INVALID_FD)
    }

    /// Append an operation to its class queue. Returns true when the queue
    /// was empty, i.e. the operation became the head and its native request
    /// must be issued now.
    pub(crate) fn enqueue(&self, op: Box<Operation>) -> bool {
        let mut q = self.queues[op.class() as usize].borrow_mut();
        q.push_back(op);
        q.len() == 1
    }

    pub(crate) fn pop_head(&self, class: OpClass) -> Option<Box<Operation>> {
        self.queues[class as usize].borrow_mut().pop_front()
    }

    pub(crate) fn is_empty(&self, class: OpClass) -> bool {
        self.queues[class as usize].borrow().is_empty()
    }

    /// Run `f` against the head operation of `class`, if any. The queue
    /// borrow is held for the duration of `f`; `f` must not re-enter the
    /// queues (native calls are fine).
    pub(crate) fn with_head_mut<R>(
        &self,
        class: OpClass,
        f: impl FnOnce(&mut Operation) -> R,
    ) -> Option<R> {
        let mut q = self.queues[class as usize].borrow_mut();
        q.front_mut().map(|op| f(op))
    }

    /// Derived registration interest: a class contributes its bit while its
    /// queue is non-empty.
    pub(crate) fn interest(&self) -> u8 {
        let mut mask = 0;
        if !self.is_empty(OpClass::In) {
            mask |= MASK_IN;
        }
        if !self.is_empty(OpClass::Out) {
            mask |= MASK_OUT;
        }
        mask
    }

    /// Remove every operation that has not been handed to the kernel,
    /// read class first, preserving per-class FIFO order. A head whose
    /// native request is in flight stays queued (completion model); under
    /// the readiness model nothing is ever "submitted", so this empties
    /// both queues.
    pub(crate) fn take_unsubmitted(&self) -> Vec<Box<Operation>> {
        let mut out = Vec::new();
        for class in 0..2 {
            let mut q = self.queues[class].borrow_mut();
            if self.submitted[class].get() {
                let head = q.pop_front();
                out.extend(q.drain(..));
                if let Some(h) = head {
                    q.push_front(h);
                }
            } else {
                out.extend(q.drain(..));
            }
        }
        out
    }

    pub(crate) fn set_submitted(&self, class: OpClass, on: bool) {
        self.submitted[class as usize].set(on);
    }

    pub(crate) fn is_submitted(&self, class: OpClass) -> bool {
        self.submitted[class as usize].get()
    }

    pub(crate) fn has_submitted(&self) -> bool {
        self.submitted[0].get() || self.submitted[1].get()
    }

    pub(crate) fn set_closing(&self) {
        self.closing.set(true);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Operation;
    use sockmux_core::Buffer;

    fn noop_read() -> Operation {
        Operation::read(Buffer::from_raw(std::ptr::null_mut(), 0), Box::new(|_| {}))
    }

    fn noop_write() -> Operation {
        Operation::write(Buffer::from_raw(std::ptr::null_mut(), 0), Box::new(|_| {}))
    }

    #[test]
    fn test_enqueue_reports_head() {
        let d = Descriptor::from_fd(10);
        assert!(d.enqueue(Box::new(noop_read())));
        assert!(!d.enqueue(Box::new(noop_read())));
        // other class has its own head
        assert!(d.enqueue(Box::new(noop_write())));
    }

    #[test]
    fn test_interest_derived_from_queues() {
        let d = Descriptor::from_fd(10);
        assert_eq!(d.interest(), 0);
        d.enqueue(Box::new(noop_read()));
        assert_eq!(d.interest(), MASK_IN);
        d.enqueue(Box::new(noop_write()));
        assert_eq!(d.interest(), MASK_IN | MASK_OUT);
        d.pop_head(OpClass::In);
        assert_eq!(d.interest(), MASK_OUT);
    }

    #[test]
    fn test_take_unsubmitted_orders_read_before_write() {
        let d = Descriptor::from_fd(10);
        d.enqueue(Box::new(noop_write()));
        d.enqueue(Box::new(noop_read()));
        d.enqueue(Box::new(noop_read()));
        let ops = d.take_unsubmitted();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].class(), OpClass::In);
        assert_eq!(ops[1].class(), OpClass::In);
        assert_eq!(ops[2].class(), OpClass::Out);
        assert!(d.is_empty(OpClass::In));
        assert!(d.is_empty(OpClass::Out));
    }

    #[test]
    fn test_take_unsubmitted_keeps_kernel_owned_head() {
        let d = Descriptor::from_fd(10);
        d.enqueue(Box::new(noop_read()));
        d.enqueue(Box::new(noop_read()));
        d.set_submitted(OpClass::In, true);
        let ops = d.take_unsubmitted();
        assert_eq!(ops.len(), 1);
        assert!(!d.is_empty(OpClass::In));
        assert!(d.is_submitted(OpClass::In));
        assert!(d.has_submitted());
    }

    #[test]
    fn test_closing_window() {
        let d = Descriptor::from_fd(10);
        assert!(!d.is_closing());
        d.set_closing();
        assert!(d.is_closing());
        // still open until the deferred release actually lands
        assert!(d.is_open());
    }

    #[test]
    fn test_invalidate() {
        let d = Descriptor::from_fd(42);
        assert!(d.is_open());
        assert_eq!(d.invalidate(), 42);
        assert!(!d.is_open());
        assert_eq!(d.invalidate(), INVALID_FD);
    }
}
