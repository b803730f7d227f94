//! I/O buffer primitives
//!
//! This module is the ONLY place where unsafe buffer manipulation is allowed.
//! All invariants are enforced here so the rest of the system can remain 100% safe.

#![allow(unsafe_code)]

use bytes::Bytes;
use compio::buf::{IoBuf, IoBufMut, SetBufInit};

/// Read target of an exact, known length.
///
/// compio's `read_exact` fills a buffer up to its capacity, and a `Vec`
/// reports its allocation capacity, which may be larger than requested.
/// `FrameBuf` reports exactly `target` instead, and skips zero-filling the
/// memory that is about to be overwritten by the kernel.
///
/// Invariant: `buf.len() <= target <= buf.capacity()`.
#[derive(Debug, Default)]
pub struct FrameBuf {
    buf: Vec<u8>,
    target: usize,
}

impl FrameBuf {
    /// A fresh buffer for exactly `len` bytes.
    #[must_use]
    pub fn with_len(len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(len),
            target: len,
        }
    }

    /// Clear and retarget for the next read, keeping the allocation.
    pub fn reset(&mut self, len: usize) {
        self.buf.clear();
        self.buf.reserve(len);
        self.target = len;
    }

    /// Returns true once the buffer holds `target` bytes.
    #[inline]
    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.buf.len() == self.target
    }

    /// The bytes read so far.
    #[inline]
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.buf
    }

    /// Take the filled bytes as an owned `Vec`.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Freeze the filled bytes into immutable `Bytes` without copying.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

// SAFETY: the pointer comes from a live Vec and [ptr, ptr + len) is initialized.
// The Vec is owned by the FrameBuf and never reallocated during I/O.
unsafe impl IoBuf for FrameBuf {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.target
    }
}

// SAFETY: [ptr, ptr + target) lies within the Vec allocation per the type invariant.
unsafe impl IoBufMut for FrameBuf {
    #[inline]
    fn as_buf_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }
}

impl SetBufInit for FrameBuf {
    #[inline]
    unsafe fn set_buf_init(&mut self, len: usize) {
        debug_assert!(len <= self.target);
        if self.buf.len() < len {
            self.buf.set_len(len);
        }
    }
}

/// Zero-copy `IoBuf` wrapper for Bytes.
///
/// Lets encoded frames go straight to compio writes without a `.to_vec()`.
pub struct IoBytes(Bytes);

impl IoBytes {
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Bytes> for IoBytes {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<IoBytes> for Bytes {
    fn from(io_bytes: IoBytes) -> Self {
        io_bytes.0
    }
}

// SAFETY: IoBytes wraps Bytes which is:
// - Immutable (no mutable aliasing)
// - Refcounted (memory stays valid)
// - Contiguous (valid pointer/len guarantees)
unsafe impl IoBuf for IoBytes {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_buf_reports_target_as_capacity() {
        let mut buf = FrameBuf::with_len(6);
        assert_eq!(buf.buf_capacity(), 6);
        assert_eq!(buf.buf_len(), 0);
        assert!(!buf.is_filled());

        buf.reset(3);
        assert_eq!(buf.buf_capacity(), 3);
        assert!(buf.filled().is_empty());
    }

    #[compio::test]
    async fn frame_buf_reads_exactly_target() {
        use compio::io::{AsyncReadExt, AsyncWriteExt};
        use compio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = compio::runtime::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = client.await;

        let mut writer = &client;
        let compio::buf::BufResult(res, _) =
            writer.write_all(IoBytes::new(Bytes::from_static(b"abcdefgh"))).await;
        res.unwrap();

        // Oversized allocation, exact read.
        let mut buf = FrameBuf::with_len(64);
        buf.reset(5);
        let mut reader = &server;
        let compio::buf::BufResult(res, buf) = reader.read_exact(buf).await;
        res.unwrap();
        assert!(buf.is_filled());
        assert_eq!(buf.freeze(), "abcde");
    }
}
