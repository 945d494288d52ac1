#![no_main]

use libfuzzer_sys::fuzz_target;
use qkd014_client::protocol::decode_key_container;

fuzz_target!(|data: &[u8]| {
    if let Ok(body) = std::str::from_utf8(data) {
        // Any KME response must decode or fail cleanly
        if let Ok(records) = decode_key_container(body, None) {
            for record in records {
                if let Ok(view) = record.borrow() {
                    assert_eq!(view.len(), record.key_size());
                }
                record.release();
            }
        }

        let _ = decode_key_container(body, Some(32));
    }
});
