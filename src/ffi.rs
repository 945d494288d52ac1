/*!
 * FFI interface for the KME client
 *
 * This module provides C-compatible functions for using the client from other languages.
 *
 * Every function returns 0 on success or the numeric code of the error (see
 * [`error_codes`](crate::error::error_codes)). When `error_msg` is not NULL it
 * receives a message that must be freed with `e14_free_error_str`.
 *
 * Key arrays are allocated by the library and owned by the caller until passed
 * to `e14_free_keys`. Key bytes stay protected until borrowed with
 * `e14_borrow_key_bytes`; the returned pointer is valid only until
 * `e14_return_key_bytes`.
 */

// Allow pointer dereferencing in FFI functions as we guarantee proper checks and safety
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::ffi::{CStr, CString};
use std::ptr;
use std::slice;
use std::time::Duration;

use libc::{c_char, c_int};

use crate::config::SessionConfig;
use crate::error::{KmeError, KmeResult};
use crate::key_record::{KeyId, KeyRecord};
use crate::secure_memory::{BufferState, SecureKeyBuffer};
use crate::security::constant_time;
use crate::session::Session;
use crate::status::KmeStatus;

/// Capacity of the identifier fields of [`E14Status`], including the NUL
pub const E14_ID_CAPACITY: usize = 256;

/// Opaque session handle
pub struct E14Session {
    inner: Session,
}

/// Status snapshot with NUL-terminated identifiers (truncated if longer)
#[repr(C)]
pub struct E14Status {
    pub source_kme_id: [c_char; E14_ID_CAPACITY],
    pub target_kme_id: [c_char; E14_ID_CAPACITY],
    pub source_sae_id: [c_char; E14_ID_CAPACITY],
    pub target_sae_id: [c_char; E14_ID_CAPACITY],
    pub key_size: u32,
    pub stored_key_count: u32,
    pub max_key_count: u32,
    pub max_key_per_request: u32,
    pub max_key_size: u32,
    pub min_key_size: u32,
    pub max_sae_id_count: u32,
}

/// One key of a library-allocated key array
///
/// `buffer` becomes NULL once the key has been released.
#[repr(C)]
pub struct E14Key {
    pub key_id: *mut c_char,
    /// Key size in bytes
    pub key_size: u32,
    pub buffer: *mut SecureKeyBuffer,
}

// Convert a KmeResult into a return code and write the message
fn handle_result<T>(result: KmeResult<T>, message_ptr: *mut *mut c_char) -> (c_int, Option<T>) {
    match result {
        Ok(value) => {
            if !message_ptr.is_null() {
                unsafe {
                    *message_ptr = ptr::null_mut();
                }
            }
            (0, Some(value))
        }
        Err(err) => {
            if !message_ptr.is_null() {
                let err_msg = CString::new(err.to_string().replace('\0', " ")).unwrap_or_default();
                unsafe {
                    *message_ptr = err_msg.into_raw();
                }
            }
            (err.error_code() as c_int, None)
        }
    }
}

fn null_argument(parameter: &str) -> KmeError {
    KmeError::invalid_argument(parameter, "a non-NULL pointer", "NULL")
}

// Read a required string argument
unsafe fn string_arg(ptr: *const c_char, parameter: &str) -> KmeResult<String> {
    if ptr.is_null() {
        return Err(null_argument(parameter));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_string)
        .map_err(|_| KmeError::invalid_argument(parameter, "UTF-8 text", "invalid UTF-8"))
}

// Read an optional string argument; NULL means "use the session default"
unsafe fn optional_string_arg(ptr: *const c_char, parameter: &str) -> KmeResult<Option<String>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        string_arg(ptr, parameter).map(Some)
    }
}

unsafe fn session_arg<'a>(session: *mut E14Session) -> KmeResult<&'a mut E14Session> {
    session.as_mut().ok_or_else(|| null_argument("session"))
}

unsafe fn buffer_arg<'a>(key: *const E14Key) -> KmeResult<&'a SecureKeyBuffer> {
    let key = key.as_ref().ok_or_else(|| null_argument("key"))?;
    key.buffer.as_ref().ok_or_else(|| {
        KmeError::invalid_argument("key", "an unreleased key", "a released key")
    })
}

fn copy_id(src: &str, dst: &mut [c_char; E14_ID_CAPACITY]) {
    let bytes = src.as_bytes();
    let len = bytes.len().min(E14_ID_CAPACITY - 1);
    for (slot, byte) in dst.iter_mut().zip(&bytes[..len]) {
        *slot = *byte as c_char;
    }
    dst[len] = 0;
}

fn status_to_c(status: &KmeStatus, out: &mut E14Status) {
    copy_id(&status.source_kme_id, &mut out.source_kme_id);
    copy_id(&status.target_kme_id, &mut out.target_kme_id);
    copy_id(&status.source_sae_id, &mut out.source_sae_id);
    copy_id(&status.target_sae_id, &mut out.target_sae_id);
    out.key_size = status.key_size;
    out.stored_key_count = status.stored_key_count;
    out.max_key_count = status.max_key_count;
    out.max_key_per_request = status.max_key_per_request;
    out.max_key_size = status.max_key_size;
    out.min_key_size = status.min_key_size;
    out.max_sae_id_count = status.max_sae_id_count;
}

// Move records into a library-allocated array
fn keys_into_raw(records: Vec<KeyRecord>) -> KmeResult<(*mut E14Key, usize)> {
    let mut keys = Vec::with_capacity(records.len());
    for record in records {
        let (key_id, buffer) = record.into_parts();
        let key_size = buffer.len() as u32;
        let key_id = match CString::new(key_id.into_string()) {
            Ok(key_id) => key_id,
            Err(_) => {
                let entries = keys.into_boxed_slice();
                free_key_slice(entries);
                return Err(KmeError::invalid_argument(
                    "key_id",
                    "an identifier without NUL bytes",
                    "an identifier containing NUL",
                ));
            }
        };
        keys.push(E14Key {
            key_id: key_id.into_raw(),
            key_size,
            buffer: Box::into_raw(Box::new(buffer)),
        });
    }

    let len = keys.len();
    let keys = Box::into_raw(keys.into_boxed_slice()) as *mut E14Key;
    Ok((keys, len))
}

fn free_key_slice(keys: Box<[E14Key]>) {
    for key in keys.iter() {
        unsafe {
            if !key.key_id.is_null() {
                drop(CString::from_raw(key.key_id));
            }
            if !key.buffer.is_null() {
                // Dropping the buffer zeroes it
                drop(Box::from_raw(key.buffer));
            }
        }
    }
}

unsafe fn write_keys(
    records: Vec<KeyRecord>,
    keys_out: *mut *mut E14Key,
    keys_len_out: *mut usize,
) -> KmeResult<()> {
    let (keys, len) = keys_into_raw(records)?;
    *keys_out = keys;
    *keys_len_out = len;
    Ok(())
}

/// Open a session to a KME
///
/// `target_sae_id` may be NULL; otherwise it becomes the session's default
/// target. `timeout_secs` of 0 selects the default timeout. On error
/// `*session_out` is set to NULL.
///
/// # Safety
///
/// String arguments must be NULL or valid NUL-terminated strings, and
/// `session_out` must point to writable memory for one pointer.
#[no_mangle]
pub unsafe extern "C" fn e14_session_open(
    host: *const c_char,
    port: u16,
    cert_path: *const c_char,
    key_path: *const c_char,
    ca_path: *const c_char,
    target_sae_id: *const c_char,
    timeout_secs: u32,
    session_out: *mut *mut E14Session,
    error_msg: *mut *mut c_char,
) -> c_int {
    if !session_out.is_null() {
        *session_out = ptr::null_mut();
    }

    let result = (|| -> KmeResult<Session> {
        if session_out.is_null() {
            return Err(null_argument("session_out"));
        }
        let mut config = SessionConfig::new(
            string_arg(host, "host")?,
            port,
            string_arg(cert_path, "cert_path")?,
            string_arg(key_path, "key_path")?,
            string_arg(ca_path, "ca_path")?,
        );
        if let Some(target) = optional_string_arg(target_sae_id, "target_sae_id")? {
            config = config.with_default_target(target);
        }
        if timeout_secs > 0 {
            config = config.with_timeout(Duration::from_secs(u64::from(timeout_secs)));
        }
        Session::open(&config)
    })();

    let (status, session) = handle_result(result, error_msg);
    if let Some(session) = session {
        *session_out = Box::into_raw(Box::new(E14Session { inner: session }));
    }
    status
}

/// Close a session and free its handle
///
/// # Safety
///
/// `session` must be NULL or a handle from `e14_session_open` that has not
/// been closed yet.
#[no_mangle]
pub unsafe extern "C" fn e14_session_close(session: *mut E14Session) {
    if !session.is_null() {
        let session = Box::from_raw(session);
        session.inner.close();
    }
}

/// Query the status for `target_sae_id` (NULL: the session default)
///
/// # Safety
///
/// `session` must be a live handle and `status_out` must point to writable
/// memory for one `E14Status`.
#[no_mangle]
pub unsafe extern "C" fn e14_get_status(
    session: *mut E14Session,
    target_sae_id: *const c_char,
    status_out: *mut E14Status,
    error_msg: *mut *mut c_char,
) -> c_int {
    let result = (|| -> KmeResult<()> {
        let session = session_arg(session)?;
        let out = status_out.as_mut().ok_or_else(|| null_argument("status_out"))?;
        let target = optional_string_arg(target_sae_id, "target_sae_id")?;
        let target = session.inner.resolve_target(target.as_deref())?;
        let status = session.inner.get_status(&target)?;
        status_to_c(&status, out);
        Ok(())
    })();

    handle_result(result, error_msg).0
}

/// Request `count` keys of `key_size_bits` for `target_sae_id` (NULL: default)
///
/// # Safety
///
/// `session` must be a live handle; `keys_out` and `keys_len_out` must point
/// to writable memory. The returned array must be freed with `e14_free_keys`.
#[no_mangle]
pub unsafe extern "C" fn e14_get_keys(
    session: *mut E14Session,
    key_size_bits: u32,
    target_sae_id: *const c_char,
    count: u32,
    keys_out: *mut *mut E14Key,
    keys_len_out: *mut usize,
    error_msg: *mut *mut c_char,
) -> c_int {
    let result = (|| -> KmeResult<()> {
        if keys_out.is_null() || keys_len_out.is_null() {
            return Err(null_argument("keys_out"));
        }
        *keys_out = ptr::null_mut();
        *keys_len_out = 0;

        let session = session_arg(session)?;
        let target = optional_string_arg(target_sae_id, "target_sae_id")?;
        let target = session.inner.resolve_target(target.as_deref())?;
        let records = session.inner.get_keys(key_size_bits, &target, None, count)?;
        write_keys(records, keys_out, keys_len_out)
    })();

    handle_result(result, error_msg).0
}

/// Retrieve keys issued to `source_sae_id` (NULL: default) by identifier
///
/// The array is in the order of `key_ids`. `count` must equal `key_ids_len`.
///
/// # Safety
///
/// `key_ids` must point to `key_ids_len` valid NUL-terminated strings;
/// otherwise the requirements of `e14_get_keys` apply.
#[no_mangle]
pub unsafe extern "C" fn e14_get_keys_by_ids(
    session: *mut E14Session,
    source_sae_id: *const c_char,
    key_ids: *const *const c_char,
    key_ids_len: usize,
    count: usize,
    keys_out: *mut *mut E14Key,
    keys_len_out: *mut usize,
    error_msg: *mut *mut c_char,
) -> c_int {
    let result = (|| -> KmeResult<()> {
        if keys_out.is_null() || keys_len_out.is_null() {
            return Err(null_argument("keys_out"));
        }
        *keys_out = ptr::null_mut();
        *keys_len_out = 0;

        let session = session_arg(session)?;
        let ids: Vec<KeyId> = if key_ids_len == 0 {
            Vec::new()
        } else {
            if key_ids.is_null() {
                return Err(null_argument("key_ids"));
            }
            slice::from_raw_parts(key_ids, key_ids_len)
                .iter()
                .map(|id| string_arg(*id, "key_ids").map(KeyId::new))
                .collect::<KmeResult<_>>()?
        };
        let source = optional_string_arg(source_sae_id, "source_sae_id")?;
        let source = session.inner.resolve_target(source.as_deref())?;
        let records = session.inner.get_keys_by_ids(&source, &ids, count)?;
        write_keys(records, keys_out, keys_len_out)
    })();

    handle_result(result, error_msg).0
}

/// Borrow the bytes of a key
///
/// Fails while the key is already borrowed. `*bytes_out` stays valid until
/// `e14_return_key_bytes`.
///
/// # Safety
///
/// `key` must point into a live array from this library; the out pointers
/// must be writable.
#[no_mangle]
pub unsafe extern "C" fn e14_borrow_key_bytes(
    key: *const E14Key,
    bytes_out: *mut *const u8,
    len_out: *mut usize,
    error_msg: *mut *mut c_char,
) -> c_int {
    let result = (|| -> KmeResult<()> {
        if bytes_out.is_null() || len_out.is_null() {
            return Err(null_argument("bytes_out"));
        }
        let buffer = buffer_arg(key)?;
        let bytes = buffer.begin_borrow("e14_borrow_key_bytes")?;
        *bytes_out = bytes.as_ptr();
        *len_out = bytes.len();
        Ok(())
    })();

    handle_result(result, error_msg).0
}

/// End the borrow started by `e14_borrow_key_bytes`
///
/// # Safety
///
/// `key` must point into a live array from this library.
#[no_mangle]
pub unsafe extern "C" fn e14_return_key_bytes(key: *const E14Key, error_msg: *mut *mut c_char) -> c_int {
    let result = buffer_arg(key).and_then(|buffer| buffer.end_borrow());
    handle_result(result, error_msg).0
}

/// Zero and free the bytes of a key; the key must not be borrowed
///
/// # Safety
///
/// `key` must point into a live array from this library.
#[no_mangle]
pub unsafe extern "C" fn e14_release_key(key: *mut E14Key, error_msg: *mut *mut c_char) -> c_int {
    let result = (|| -> KmeResult<()> {
        if buffer_arg(key)?.state() == BufferState::Borrowed {
            return Err(KmeError::already_borrowed("e14_release_key"));
        }
        let entry = &mut *key;
        let buffer = Box::from_raw(entry.buffer);
        entry.buffer = ptr::null_mut();
        buffer.release();
        Ok(())
    })();

    handle_result(result, error_msg).0
}

/// Free an array returned by `e14_get_keys` or `e14_get_keys_by_ids`
///
/// Keys not yet released are zeroed. Outstanding borrows become invalid.
///
/// # Safety
///
/// `keys` and `len` must come from the same successful call, and the array
/// must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn e14_free_keys(keys: *mut E14Key, len: usize) {
    if keys.is_null() {
        return;
    }
    let entries = Box::from_raw(slice::from_raw_parts_mut(keys, len));
    free_key_slice(entries);
}

/// Compare the bytes of two keys in constant time
///
/// `*equal_out` is 1 when the keys are equal and 0 otherwise. Neither key may
/// be borrowed.
///
/// # Safety
///
/// Both keys must point into live arrays from this library; `equal_out` must
/// be writable.
#[no_mangle]
pub unsafe extern "C" fn e14_keys_equal(
    a: *const E14Key,
    b: *const E14Key,
    equal_out: *mut c_int,
    error_msg: *mut *mut c_char,
) -> c_int {
    let result = (|| -> KmeResult<()> {
        let out = equal_out.as_mut().ok_or_else(|| null_argument("equal_out"))?;
        let equal = constant_time::buffers_equal(buffer_arg(a)?, buffer_arg(b)?)?;
        *out = c_int::from(equal);
        Ok(())
    })();

    handle_result(result, error_msg).0
}

/// Free an error message
///
/// # Safety
///
/// `ptr` must be NULL or a message written by this library that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn e14_free_error_str(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}
