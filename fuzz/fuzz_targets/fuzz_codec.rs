#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use adc_client::core::codec::TransferCodec;
use adc_client::core::message::Message;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Peer framing: lines, then a body whose mode comes from the first byte
    let Some((&mode, rest)) = data.split_first() else {
        return;
    };
    let mut codec = TransferCodec::new(4096);
    codec.expect_body(u64::from(mode & 0x7f) * 16, mode & 0x80 != 0);

    let mut buf = BytesMut::from(rest);
    while let Ok(Some(_frame)) = codec.decode(&mut buf) {}

    // Anything that parses must format back to a parseable line
    if let Ok(line) = std::str::from_utf8(rest) {
        if let Ok(msg) = Message::parse(line) {
            let again = Message::parse(&msg.format());
            assert_eq!(again.ok(), Some(msg));
        }
    }
});
