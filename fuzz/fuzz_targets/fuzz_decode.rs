#![no_main]
use libfuzzer_sys::fuzz_target;
use std::io::Read;

fuzz_target!(|data: &[u8]| {
    let config = zenflv::DecodeConfig::default()
        .with_max_script_data_size(64 * 1024)
        .lenient(true);
    let Ok(mut decoder) = zenflv::Decoder::with_config(data, config) else {
        return;
    };
    let mut sink = Vec::new();
    loop {
        match decoder.decode() {
            Ok(Some(mut tag)) => {
                // Alternate between reading and skipping payloads.
                if tag.timestamp % 2 == 0 {
                    if let Some(payload) = tag.data.payload_mut() {
                        sink.clear();
                        let _ = payload.read_to_end(&mut sink);
                    }
                }
            },
            Ok(None) => break,
            Err(e) if e.is_recoverable() => {},
            Err(_) => break,
        }
    }

    let _ = zenflv::read_flv(&mut &data[..]);
});
