//! Property tests for key buffers and key decoding

use proptest::prelude::*;

use qkd014_client::prelude::*;

proptest! {
    #[test]
    fn borrowed_bytes_equal_input(bytes in prop::collection::vec(any::<u8>(), 1..4096)) {
        let buffer = SecureKeyBuffer::from_slice(&bytes).unwrap();
        prop_assert_eq!(buffer.len(), bytes.len());
        {
            let view = buffer.borrow().unwrap();
            prop_assert_eq!(&view[..], &bytes[..]);
            prop_assert!(buffer.borrow().is_err());
        }
        prop_assert_eq!(buffer.state(), BufferState::Protected);
        buffer.release();
    }

    #[test]
    fn key_size_accepts_only_whole_bytes(bits in any::<u32>()) {
        match validate_key_size(bits) {
            Ok(bytes) => {
                prop_assert!(bits > 0 && bits % 8 == 0);
                prop_assert_eq!(bytes * 8, bits as usize);
            }
            Err(err) => {
                prop_assert!(bits == 0 || bits % 8 != 0);
                prop_assert_eq!(err.kind(), ErrorKind::InvalidKeySize);
            }
        }
    }

    #[test]
    fn constant_time_equality_matches_slice_equality(
        a in prop::collection::vec(any::<u8>(), 0..64),
        b in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        prop_assert_eq!(bytes_equal(&a, &b), a == b);
        prop_assert!(bytes_equal(&a, &a));
    }

    #[test]
    fn decoded_keys_keep_their_bytes(
        keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 32), 1..8),
    ) {
        let entries: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| format!(r#"{{"key_ID":"key-{}","key":"{}"}}"#, i, base64::encode(key)))
            .collect();
        let body = format!(r#"{{"keys":[{}]}}"#, entries.join(","));

        let records = decode_key_container(&body, Some(32)).unwrap();
        prop_assert_eq!(records.len(), keys.len());
        for (record, key) in records.iter().zip(&keys) {
            let view = record.borrow().unwrap();
            prop_assert!(bytes_equal(&view, key));
        }
    }

    #[test]
    fn decoding_never_panics(body in ".{0,256}") {
        let _ = decode_key_container(&body, None);
    }
}

#[test]
fn test_buffers_compare_in_constant_time() {
    let a = SecureKeyBuffer::from_slice(&[3u8; 64]).unwrap();
    let b = SecureKeyBuffer::from_slice(&[3u8; 64]).unwrap();
    let c = SecureKeyBuffer::from_slice(&[4u8; 64]).unwrap();

    assert!(buffers_equal(&a, &b).unwrap());
    assert!(!buffers_equal(&a, &c).unwrap());

    let held = a.borrow().unwrap();
    assert_eq!(buffers_equal(&a, &b).unwrap_err().kind(), ErrorKind::AlreadyBorrowed);
    held.return_borrow();
    assert!(buffers_equal(&a, &b).unwrap());
}

#[test]
fn test_buffer_moves_between_threads() {
    let buffer = SecureKeyBuffer::from_slice(&[9u8; 16]).unwrap();
    let handle = std::thread::spawn(move || {
        let sum: u32 = buffer.borrow().unwrap().iter().map(|b| u32::from(*b)).sum();
        buffer.release();
        sum
    });
    assert_eq!(handle.join().unwrap(), 144);
}
