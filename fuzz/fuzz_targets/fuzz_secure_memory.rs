#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qkd014_client::secure_memory::{BufferState, SecureKeyBuffer};

#[derive(Arbitrary, Debug)]
enum Step {
    Borrow,
    Return,
    Compare,
}

#[derive(Arbitrary, Debug)]
struct SecureMemoryFuzzInput {
    key: Vec<u8>,
    steps: Vec<Step>,
}

fuzz_target!(|input: SecureMemoryFuzzInput| {
    // Limit buffer size to avoid excessive memory usage
    if input.key.is_empty() || input.key.len() > 4096 {
        return;
    }

    let buffer = SecureKeyBuffer::from_slice(&input.key).unwrap();
    let mut held = None;

    for step in input.steps.iter().take(64) {
        match step {
            Step::Borrow => match buffer.borrow() {
                Ok(view) => {
                    assert!(held.is_none());
                    assert_eq!(&view[..], &input.key[..]);
                    held = Some(view);
                }
                Err(_) => assert!(held.is_some()),
            },
            Step::Return => {
                if let Some(view) = held.take() {
                    view.return_borrow();
                }
            }
            Step::Compare => {
                let result = qkd014_client::security::buffers_equal(&buffer, &buffer);
                assert!(result.is_err());
            }
        }

        let expected = if held.is_some() {
            BufferState::Borrowed
        } else {
            BufferState::Protected
        };
        assert_eq!(buffer.state(), expected);
    }

    drop(held);
    buffer.release();
});
