/*!
 * Constant-Time Comparison of Key Material
 *
 * Two SAEs confirm they hold the same key by comparing bytes. The comparison
 * must not leak, through its running time, how many leading bytes agree.
 */

use subtle::ConstantTimeEq;

use crate::error::KmeResult;
use crate::secure_memory::SecureKeyBuffer;

/// Compare two byte slices in constant time
///
/// Slice lengths are not secret; slices of different length compare unequal
/// without inspecting their contents.
pub fn bytes_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Compare the contents of two key buffers in constant time
///
/// Both buffers are borrowed for the duration of the comparison and returned
/// afterwards. Fails with `AlreadyBorrowed` if either one is already borrowed,
/// including when `a` and `b` are the same buffer.
pub fn buffers_equal(a: &SecureKeyBuffer, b: &SecureKeyBuffer) -> KmeResult<bool> {
    let left = a.borrow()?;
    let right = b.borrow()?;
    let equal = bytes_equal(&left, &right);
    right.return_borrow();
    left.return_borrow();
    Ok(equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_bytes_equal() {
        assert!(bytes_equal(b"abcdef", b"abcdef"));
        assert!(!bytes_equal(b"abcdef", b"abcdeg"));
        assert!(!bytes_equal(b"abc", b"abcd"));
        assert!(bytes_equal(b"", b""));
    }

    #[test]
    fn test_buffers_equal() {
        let a = SecureKeyBuffer::from_slice(&[0x10; 32]).unwrap();
        let b = SecureKeyBuffer::from_slice(&[0x10; 32]).unwrap();
        let mut other = [0x10; 32];
        other[31] = 0x11;
        let c = SecureKeyBuffer::from_slice(&other).unwrap();

        assert!(buffers_equal(&a, &b).unwrap());
        assert!(!buffers_equal(&a, &c).unwrap());
    }

    #[test]
    fn test_same_buffer_cannot_be_compared_with_itself() {
        let a = SecureKeyBuffer::from_slice(&[1u8; 8]).unwrap();
        let err = buffers_equal(&a, &a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyBorrowed);
        // The first borrow was handed back on the error path
        assert!(a.borrow().is_ok());
    }
}
