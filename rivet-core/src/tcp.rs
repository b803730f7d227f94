//! TCP socket helpers.
//!
//! Socket options and shutdown go through `socket2` on the raw descriptor,
//! since compio streams do not expose them directly.
//!
//! # Safety
//!
//! Raw descriptors are borrowed only for the duration of a call: the
//! temporary `socket2::Socket` is forgotten instead of dropped so the
//! stream keeps ownership of its fd.

#![allow(unsafe_code)]

use parking_lot::Mutex;
use std::io;
use std::net::Shutdown;

/// Run `f` against a borrowed `socket2` view of the stream.
fn with_socket<R>(
    stream: &compio::net::TcpStream,
    f: impl FnOnce(&socket2::Socket) -> io::Result<R>,
) -> io::Result<R> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let sock = unsafe { socket2::Socket::from_raw_fd(stream.as_raw_fd()) };
        let res = f(&sock);
        std::mem::forget(sock); // Don't close the fd
        res
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let sock = unsafe { socket2::Socket::from_raw_socket(stream.as_raw_socket()) };
        let res = f(&sock);
        std::mem::forget(sock); // Don't close the socket
        res
    }
}

/// Disable Nagle's algorithm. Frames are small and latency-sensitive.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &compio::net::TcpStream) -> io::Result<()> {
    with_socket(stream, |sock| sock.set_nodelay(true))
}

/// A thread-safe handle that can tear a connection down from anywhere.
///
/// Holds a duplicated descriptor, so shutting it down interrupts reads and
/// writes pending on the original stream. Reads there observe EOF and
/// writes fail with a broken pipe.
#[derive(Debug, Default)]
pub struct ShutdownHandle {
    socket: Mutex<Option<socket2::Socket>>,
}

impl ShutdownHandle {
    /// Duplicate the descriptor of `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be duplicated.
    pub fn new(stream: &compio::net::TcpStream) -> io::Result<Self> {
        let dup = with_socket(stream, socket2::Socket::try_clone)?;
        Ok(Self {
            socket: Mutex::new(Some(dup)),
        })
    }

    /// Shut both directions down and release the duplicate. Idempotent.
    pub fn shutdown(&self) {
        if let Some(sock) = self.socket.lock().take() {
            // NotConnected just means the peer already went away.
            let _ = sock.shutdown(Shutdown::Both);
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.socket.lock().is_none()
    }
}
