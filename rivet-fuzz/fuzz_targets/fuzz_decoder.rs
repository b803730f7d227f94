#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use rivet_wire::codec::{decode_body, encode, split_sub_messages, MsgType, LENGTH_FIELD_LEN};

const MAX_INCOMING: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    // Arbitrary frame bodies must never panic, whatever the flag and type bytes say.
    if let Ok(frame) = decode_body(data, MAX_INCOMING) {
        assert!(frame.payload.len() <= MAX_INCOMING);

        if frame.msg_type == MsgType::Raw {
            if let Ok(messages) = frame.sub_messages() {
                let total: usize = messages.iter().map(|m| m.len() + 4).sum();
                assert_eq!(total, frame.payload.len());
            }
        }
    }

    // Whatever splits cleanly must survive a re-encode.
    let payload = Bytes::copy_from_slice(data);
    if let Ok(messages) = split_sub_messages(&payload) {
        let batch = rivet_wire::codec::encode_batch(&messages).unwrap();
        assert_eq!(batch, payload);
    }

    // Plain and gzip frames of fuzzed payloads decode back to the input.
    if data.len() <= MAX_INCOMING {
        for compress in [false, true] {
            let frame = encode(data, MsgType::Raw, compress).unwrap();
            let decoded = decode_body(&frame[LENGTH_FIELD_LEN..], MAX_INCOMING).unwrap();
            assert_eq!(&decoded.payload[..], data);
        }
    }
});
