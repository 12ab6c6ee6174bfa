#![no_main]

use libfuzzer_sys::fuzz_target;
use adc_client::utils::compression::Inflater;

fuzz_target!(|data: &[u8]| {
    // Malformed or oversized zlib streams must fail, never panic or overrun
    if data.len() < 2 {
        return;
    }
    let expected = u64::from(data[0]) * 64;
    let mut inflater = Inflater::new(expected);
    let mut input = &data[1..];
    while !input.is_empty() && !inflater.is_finished() {
        match inflater.inflate(input) {
            Ok((0, out)) if out.is_empty() => break,
            Ok((consumed, _)) => input = &input[consumed..],
            Err(_) => return,
        }
    }
    let _ = inflater.check_complete();
});
