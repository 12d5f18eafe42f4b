//! Non-owning buffer view for data transfers.
//!
//! A `Buffer` is a raw pointer + length pair. It never allocates and never
//! frees; the memory belongs to the caller and must outlive every operation
//! that references it. After a partial transfer the caller can `advance()`
//! past the transferred prefix and resubmit.

/// View over caller-owned memory used by every read/write operation.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    ptr: *mut u8,
    len: usize,
}

// Safety: a Buffer is just a pointer + length. The caller guarantees the
// memory stays valid and unaliased for the duration of the operation.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Wrap raw parts. `ptr` must stay valid for `len` bytes while any
    /// operation references this buffer.
    pub fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// View over a mutable byte slice (read targets).
    pub fn from_slice_mut(s: &mut [u8]) -> Self {
        Self { ptr: s.as_mut_ptr(), len: s.len() }
    }

    /// View over an immutable byte slice (write sources). The engine never
    /// writes through a buffer submitted to a send-class operation.
    pub fn from_slice(s: &[u8]) -> Self {
        Self { ptr: s.as_ptr() as *mut u8, len: s.len() }
    }

    /// Repoint the view.
    pub fn reset(&mut self, ptr: *mut u8, len: usize) {
        self.ptr = ptr;
        self.len = len;
    }

    /// Skip `n` transferred bytes; clamps at the end of the view.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.len);
        self.ptr = unsafe { self.ptr.add(n) };
        self.len -= n;
    }

    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice() {
        let mut data = [0u8; 16];
        let buf = Buffer::from_slice_mut(&mut data);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.ptr(), data.as_mut_ptr());
    }

    #[test]
    fn test_advance_partial() {
        let mut data = *b"hello world";
        let mut buf = Buffer::from_slice_mut(&mut data);
        buf.advance(6);
        assert_eq!(buf.len(), 5);
        let rest = unsafe { std::slice::from_raw_parts(buf.ptr(), buf.len()) };
        assert_eq!(rest, b"world");
    }

    #[test]
    fn test_advance_clamps() {
        let mut data = [0u8; 4];
        let mut buf = Buffer::from_slice_mut(&mut data);
        buf.advance(100);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reset() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 8];
        let mut buf = Buffer::from_slice_mut(&mut a);
        buf.reset(b.as_mut_ptr(), b.len());
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.ptr(), b.as_mut_ptr());
    }
}
