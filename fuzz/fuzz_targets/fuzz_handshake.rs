#![no_main]

use libfuzzer_sys::fuzz_target;
use adc_client::core::identifier::Identifier;
use adc_client::core::message::Message;
use adc_client::protocol::handshake::{HubHandshake, LocalIdentity};

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary hub lines to the login state machine
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let identity = LocalIdentity::new(Identifier::private(vec![1u8; 24]), "fuzz")
        .with_password(Some("pw".into()));
    let mut handshake = HubHandshake::new(identity);
    let _ = handshake.start();

    for line in text.lines() {
        let Ok(msg) = Message::parse(line) else {
            continue;
        };
        if handshake.on_message(&msg).is_err() || handshake.is_complete() {
            break;
        }
    }
    let _ = handshake.finish();
});
