//! Frame decoding over a real TCP pair.

use bytes::Bytes;
use compio::io::AsyncWriteExt;
use compio::net::{TcpListener, TcpStream};
use rivet_core::error::RivetError;
use rivet_wire::codec::{encode, encode_batch, FrameDecoder, MsgType};
use std::io;
use std::time::{Duration, Instant};

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = compio::runtime::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (server, _) = listener.accept().await.unwrap();
    (client.await, server)
}

async fn write_raw(stream: &TcpStream, data: Vec<u8>) {
    let mut writer = stream;
    let compio::buf::BufResult(res, _) = writer.write_all(data).await;
    res.unwrap();
}

#[compio::test]
async fn test_decodes_consecutive_frames() {
    let (client, server) = tcp_pair().await;

    let batch = encode_batch([&b"alpha"[..], b"beta"]).unwrap();
    let mut wire = Vec::new();
    wire.extend_from_slice(&encode(&batch, MsgType::Raw, false).unwrap());
    wire.extend_from_slice(&encode(&[], MsgType::Heartbeat, false).unwrap());
    wire.extend_from_slice(&encode(&batch, MsgType::Raw, true).unwrap());
    wire.extend_from_slice(&encode(&[], MsgType::HeartbeatAck, false).unwrap());
    write_raw(&client, wire).await;

    let mut decoder = FrameDecoder::new(1024);
    let mut reader = &server;
    let timeout = Some(Duration::from_secs(1));

    let frame = decoder.decode_frame(&mut reader, timeout).await.unwrap();
    assert_eq!(frame.msg_type, MsgType::Raw);
    assert_eq!(frame.sub_messages().unwrap(), vec![
        Bytes::from_static(b"alpha"),
        Bytes::from_static(b"beta"),
    ]);

    let frame = decoder.decode_frame(&mut reader, timeout).await.unwrap();
    assert_eq!(frame.msg_type, MsgType::Heartbeat);
    assert!(frame.payload.is_empty());

    // Gzipped frame decodes to the same batch.
    let frame = decoder.decode_frame(&mut reader, timeout).await.unwrap();
    assert_eq!(frame.payload, batch);

    let frame = decoder.decode_frame(&mut reader, timeout).await.unwrap();
    assert_eq!(frame.msg_type, MsgType::HeartbeatAck);
}

#[compio::test]
async fn test_max_sized_frame_accepted() {
    let (client, server) = tcp_pair().await;

    // length = 2 + payload, exactly at the limit
    let payload = vec![0xabu8; 1022];
    write_raw(&client, encode(&payload, MsgType::Raw, false).unwrap().to_vec()).await;

    let mut decoder = FrameDecoder::new(1024);
    let mut reader = &server;
    let frame = decoder.decode_frame(&mut reader, None).await.unwrap();
    assert_eq!(frame.payload.len(), 1022);
}

#[compio::test]
async fn test_oversize_rejected_before_body() {
    let (client, server) = tcp_pair().await;

    // Only the length field is ever sent; a body read would hang.
    write_raw(&client, 1025u32.to_be_bytes().to_vec()).await;

    let mut decoder = FrameDecoder::new(1024);
    let mut reader = &server;
    let start = Instant::now();
    let err = decoder
        .decode_frame(&mut reader, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RivetError::ExceedMaxIncomingPacket { size: 1025, max: 1024 }
    ));
    assert!(!err.is_recoverable());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[compio::test]
async fn test_read_deadline_covers_partial_frame() {
    let (client, server) = tcp_pair().await;

    // Header promises 10 bytes, only 3 arrive.
    let mut partial = 10u32.to_be_bytes().to_vec();
    partial.extend_from_slice(&[0, 0, 1]);
    write_raw(&client, partial).await;

    let mut decoder = FrameDecoder::new(1024);
    let mut reader = &server;
    let err = decoder
        .decode_frame(&mut reader, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();

    match err {
        RivetError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[compio::test]
async fn test_eof_mid_frame_normalizes_to_canceled() {
    let (client, server) = tcp_pair().await;

    write_raw(&client, vec![0, 0, 0, 8, 0]).await;
    drop(client);

    let mut decoder = FrameDecoder::new(1024);
    let mut reader = &server;
    let err = decoder.decode_frame(&mut reader, None).await.unwrap_err();
    assert!(matches!(err, RivetError::Io(_)));
    assert!(err.normalize().is_canceled());
}

#[compio::test]
async fn test_short_length_is_protocol_error() {
    let (client, server) = tcp_pair().await;
    write_raw(&client, vec![0, 0, 0, 1, 0]).await;

    let mut decoder = FrameDecoder::new(1024);
    let mut reader = &server;
    let err = decoder.decode_frame(&mut reader, None).await.unwrap_err();
    assert!(err.is_protocol_violation());
}
