//! Timeout utilities for I/O operations
//!
//! Wraps compio's `read_exact`/`write_all` with an optional deadline. An
//! elapsed deadline surfaces as `io::ErrorKind::TimedOut`.

use compio::buf::{BufResult, IoBuf, IoBufMut};
use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use compio::time::timeout;
use std::io;
use std::time::Duration;

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} operation timed out"))
}

/// Read exactly the full buffer, giving up after `duration`.
///
/// `None` or a zero duration waits indefinitely. On timeout the buffer is
/// dropped along with the in-flight operation.
pub async fn read_exact_with_timeout<S, B>(
    stream: &mut S,
    buf: B,
    duration: Option<Duration>,
) -> io::Result<BufResult<(), B>>
where
    S: AsyncRead,
    B: IoBufMut,
{
    match duration {
        Some(d) if !d.is_zero() => timeout(d, stream.read_exact(buf))
            .await
            .map_err(|_elapsed| timed_out("Read")),
        _ => Ok(stream.read_exact(buf).await),
    }
}

/// Write the entire buffer, giving up after `duration`.
///
/// `None` or a zero duration waits indefinitely.
pub async fn write_all_with_timeout<S, B>(
    stream: &mut S,
    buf: B,
    duration: Option<Duration>,
) -> io::Result<BufResult<(), B>>
where
    S: AsyncWrite,
    B: IoBuf,
{
    match duration {
        Some(d) if !d.is_zero() => timeout(d, stream.write_all(buf))
            .await
            .map_err(|_elapsed| timed_out("Write")),
        _ => Ok(stream.write_all(buf).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compio::net::{TcpListener, TcpStream};

    #[compio::test]
    async fn read_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = compio::runtime::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let _client = client.await;

        let mut reader = &server;
        let err = read_exact_with_timeout(&mut reader, vec![0u8; 8], Some(Duration::from_millis(20)))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[compio::test]
    async fn write_then_read_within_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = compio::runtime::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = client.await;

        let mut writer = &client;
        let BufResult(res, _) =
            write_all_with_timeout(&mut writer, b"ping".to_vec(), Some(Duration::from_secs(1)))
                .await
                .unwrap();
        res.unwrap();

        let mut reader = &server;
        let BufResult(res, buf) = read_exact_with_timeout(&mut reader, vec![0u8; 4], None)
            .await
            .unwrap();
        res.unwrap();
        assert_eq!(buf, b"ping");
    }
}
