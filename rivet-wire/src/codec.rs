//! Rivet wire codec
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! +------------+-------------+----------+---------------------+
//! | length u32 | gzipped u8  | type i8  | payload (length-2)  |
//! +------------+-------------+----------+---------------------+
//! ```
//!
//! `length` counts every byte after itself. A `Raw` payload, once
//! decompressed, is a batch of sub-messages:
//!
//! ```text
//! +---------------+-------------------+
//! | subLength u32 | data (subLength)  |  ...repeated
//! +---------------+-------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use compio::io::AsyncRead;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rivet_core::alloc::FrameBuf;
use rivet_core::error::{Result, RivetError};
use rivet_core::timeout::read_exact_with_timeout;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::trace;

/// Size of the frame length field
pub const LENGTH_FIELD_LEN: usize = 4;

/// Size of the gzip flag plus the type byte
pub const FRAME_PREFIX_LEN: usize = 2;

/// Size of a sub-message length field
pub const SUB_LENGTH_LEN: usize = 4;

/// Frame type carried in the type byte
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Batch of application sub-messages
    Raw = 0,
    /// Keepalive probe
    Heartbeat = 1,
    /// Keepalive answer
    HeartbeatAck = 2,
}

impl TryFrom<i8> for MsgType {
    type Error = RivetError;

    fn try_from(value: i8) -> Result<Self> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::HeartbeatAck),
            other => Err(RivetError::protocol(format!("unknown frame type {other}"))),
        }
    }
}

/// A decoded frame. `payload` is already decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub payload: Bytes,
}

impl Frame {
    /// Split a `Raw` payload into its sub-messages.
    pub fn sub_messages(&self) -> Result<Vec<Bytes>> {
        split_sub_messages(&self.payload)
    }
}

/// Encode one frame, ready for a single write.
///
/// When `compress` is set the payload is always gzipped, whatever its size.
pub fn encode(payload: &[u8], msg_type: MsgType, compress: bool) -> Result<Bytes> {
    let compressed;
    let body: &[u8] = if compress {
        compressed = gzip(payload)?;
        &compressed
    } else {
        payload
    };

    let length = u32::try_from(FRAME_PREFIX_LEN + body.len()).map_err(|_| {
        RivetError::MessageTooLarge {
            size: body.len(),
            max: u32::MAX as usize - FRAME_PREFIX_LEN,
        }
    })?;

    let mut out = BytesMut::with_capacity(LENGTH_FIELD_LEN + FRAME_PREFIX_LEN + body.len());
    out.put_u32(length);
    out.put_u8(u8::from(compress));
    out.put_i8(msg_type as i8);
    out.extend_from_slice(body);
    Ok(out.freeze())
}

/// Encoded size of `data` once wrapped as a sub-message.
#[inline]
#[must_use]
pub const fn sub_message_len(data: &[u8]) -> usize {
    SUB_LENGTH_LEN + data.len()
}

/// The `subLength` field for a message of `len` bytes.
fn sub_length(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| RivetError::MessageTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

/// Append one `subLength|data` sub-message to `dst`.
///
/// Fails with [`RivetError::MessageTooLarge`] when `data` does not fit the
/// 32-bit length field; `dst` is left untouched.
#[inline]
pub fn put_sub_message(dst: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = sub_length(data.len())?;
    dst.reserve(sub_message_len(data));
    dst.put_u32(len);
    dst.extend_from_slice(data);
    Ok(())
}

/// Lay out a batch of sub-messages as one `Raw` payload.
pub fn encode_batch<I, B>(messages: I) -> Result<Bytes>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut out = BytesMut::new();
    for msg in messages {
        put_sub_message(&mut out, msg.as_ref())?;
    }
    Ok(out.freeze())
}

/// Split a `Raw` payload into sub-messages.
///
/// A truncated length field or body is a protocol violation. Slices share
/// the payload allocation.
pub fn split_sub_messages(payload: &Bytes) -> Result<Vec<Bytes>> {
    let mut out = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let rest = &payload[offset..];
        if rest.len() < SUB_LENGTH_LEN {
            return Err(RivetError::protocol(format!(
                "truncated sub-message length: {} bytes left",
                rest.len()
            )));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let start = offset + SUB_LENGTH_LEN;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= payload.len())
            .ok_or_else(|| {
                RivetError::protocol(format!(
                    "truncated sub-message: declared {len} bytes, {} available",
                    payload.len() - start
                ))
            })?;

        out.push(payload.slice(start..end));
        offset = end;
    }

    Ok(out)
}

/// Decode a frame body (everything after the length field).
///
/// Decompressed payloads larger than `max_incoming` are rejected with
/// [`RivetError::ExceedMaxIncomingPacket`].
pub fn decode_body(body: &[u8], max_incoming: usize) -> Result<Frame> {
    if body.len() < FRAME_PREFIX_LEN {
        return Err(RivetError::protocol(format!(
            "frame body too short: {} bytes",
            body.len()
        )));
    }

    let gzipped = body[0] != 0;
    let msg_type = MsgType::try_from(body[1] as i8)?;
    let data = &body[FRAME_PREFIX_LEN..];

    let payload = if gzipped {
        Bytes::from(gunzip(data, max_incoming)?)
    } else {
        Bytes::copy_from_slice(data)
    };

    Ok(Frame { msg_type, payload })
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| RivetError::compression(format!("gzip failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| RivetError::compression(format!("gzip failed: {e}")))
}

fn gunzip(data: &[u8], max: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    // One byte past the limit is enough to tell an oversized payload apart.
    GzDecoder::new(data)
        .take(max as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| RivetError::compression(format!("gunzip failed: {e}")))?;

    if out.len() > max {
        return Err(RivetError::ExceedMaxIncomingPacket {
            size: out.len(),
            max,
        });
    }
    Ok(out)
}

/// Stateful frame reader.
///
/// Header and body buffers are reused across frames. The body buffer is
/// sized per frame and never beyond `max_incoming`.
#[derive(Debug)]
pub struct FrameDecoder {
    max_incoming: usize,
    header: Option<FrameBuf>,
    body: Option<FrameBuf>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_incoming: usize) -> Self {
        Self {
            max_incoming,
            header: Some(FrameBuf::with_len(LENGTH_FIELD_LEN)),
            body: Some(FrameBuf::default()),
        }
    }

    /// Configured incoming limit.
    #[inline]
    #[must_use]
    pub const fn max_incoming(&self) -> usize {
        self.max_incoming
    }

    /// Read one whole frame from `stream`.
    ///
    /// `read_timeout` bounds the whole frame, header and body together.
    /// The declared length is checked before any body byte is read.
    pub async fn decode_frame<S>(
        &mut self,
        stream: &mut S,
        read_timeout: Option<Duration>,
    ) -> Result<Frame>
    where
        S: AsyncRead,
    {
        let deadline = read_timeout
            .filter(|d| !d.is_zero())
            .map(|d| Instant::now() + d);

        let mut header = self.header.take().unwrap_or_default();
        header.reset(LENGTH_FIELD_LEN);
        let compio::buf::BufResult(res, header) =
            read_exact_with_timeout(stream, header, remaining(deadline)?).await?;
        let filled = res.map(|()| {
            let prefix = header.filled();
            u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize
        });
        self.header = Some(header);
        let length = filled?;

        if length > self.max_incoming {
            trace!(length, max = self.max_incoming, "[FrameDecoder] rejecting oversized frame");
            return Err(RivetError::ExceedMaxIncomingPacket {
                size: length,
                max: self.max_incoming,
            });
        }
        if length < FRAME_PREFIX_LEN {
            return Err(RivetError::protocol(format!("frame length {length} below minimum")));
        }

        let mut body = self.body.take().unwrap_or_default();
        body.reset(length);
        let compio::buf::BufResult(res, body) =
            read_exact_with_timeout(stream, body, remaining(deadline)?).await?;
        let frame = res
            .map_err(RivetError::from)
            .and_then(|()| decode_body(body.filled(), self.max_incoming));
        self.body = Some(body);
        frame
    }
}

/// Time left until `deadline`. An expired deadline is a timeout.
fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Read operation timed out",
                )
                .into());
            }
            Ok(Some(left))
        }
    }
}
