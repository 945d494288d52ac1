//! Secure Memory for Key Material
//!
//! Key bytes delivered by a KME live in page-aligned allocations that are
//! locked in physical memory (so they are never written to swap) and, while no
//! caller is reading them, mapped without any access rights.
//!
//! A [`SecureKeyBuffer`] only exposes its bytes through a [`KeyBorrow`] handle.
//! At most one handle may be outstanding per buffer; returning the handle (or
//! dropping it) removes access again. The memory is overwritten with zeros
//! exactly once, when the buffer is released or dropped, before it is handed
//! back to the allocator.
//!
//! # Example
//!
//! ```
//! use qkd014_client::secure_memory::SecureKeyBuffer;
//!
//! let buffer = SecureKeyBuffer::from_slice(&[0x42; 32]).unwrap();
//! {
//!     let key = buffer.borrow().unwrap();
//!     assert_eq!(key.len(), 32);
//!     // A second borrow is refused while the first is outstanding
//!     assert!(buffer.borrow().is_err());
//!     key.return_borrow();
//! }
//! // Overwrites the key bytes and frees the pages
//! buffer.release();
//! ```

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::slice;

use zeroize::Zeroize;

use crate::error::{error_codes, KmeError, KmeResult};

#[cfg(unix)]
use libc::{mlock, mprotect, munlock, ENOMEM, PROT_NONE, PROT_READ, PROT_WRITE};

#[cfg(windows)]
use winapi::um::memoryapi::{VirtualLock, VirtualProtect, VirtualUnlock};
#[cfg(windows)]
use winapi::um::winnt::{PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE};

/// Lifecycle state of a [`SecureKeyBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Bytes are not addressable by callers
    Protected,
    /// A [`KeyBorrow`] is outstanding
    Borrowed,
    /// Bytes have been overwritten with zeros
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

/// Page-granular allocation locked in RAM with adjustable access rights
struct LockedPages {
    ptr: NonNull<u8>,
    layout: Layout,
    /// Number of meaningful bytes at the start of the allocation
    len: usize,
    locked: bool,
    /// False when the platform refused to change page protection
    protectable: bool,
    zeroed: bool,
    /// Set when the pages could not be made writable again for zeroing; such
    /// pages are never returned to the allocator.
    stranded: bool,
}

// Safety: LockedPages exclusively owns its allocation
unsafe impl Send for LockedPages {}

impl LockedPages {
    fn new(len: usize) -> KmeResult<Self> {
        if len == 0 {
            return Err(KmeError::invalid_argument("len", "greater than 0", "0"));
        }

        let page = page_size();
        let capacity = len
            .checked_add(page - 1)
            .map(|n| n / page * page)
            .ok_or_else(|| {
                KmeError::memory_error(
                    "allocation",
                    "Requested size overflows",
                    error_codes::MEMORY_ALLOCATION_FAILED,
                )
            })?;

        let layout = Layout::from_size_align(capacity, page).map_err(|_| {
            KmeError::memory_error(
                "allocation",
                "Invalid memory layout requested",
                error_codes::MEMORY_ALLOCATION_FAILED,
            )
        })?;

        // Safety: layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            KmeError::memory_error(
                "allocation",
                "Memory allocation failed",
                error_codes::MEMORY_ALLOCATION_FAILED,
            )
        })?;

        let mut pages = Self {
            ptr,
            layout,
            len,
            locked: false,
            protectable: true,
            zeroed: false,
            stranded: false,
        };

        match pages.lock_memory() {
            Ok(()) => pages.locked = true,
            Err(e) => log::warn!(
                "Failed to lock key memory ({}). Key material may be swapped to disk.",
                e
            ),
        }

        Ok(pages)
    }

    /// Remove all access rights once the key bytes are in place
    fn seal(&mut self) {
        if let Err(e) = self.set_access(Access::NoAccess) {
            log::warn!(
                "Failed to protect key memory ({}). Key bytes stay readable between borrows.",
                e
            );
            self.protectable = false;
        }
    }

    fn as_slice(&self) -> &[u8] {
        // Safety: ptr is valid for `len` bytes for the lifetime of self
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: ptr is valid for `len` bytes and uniquely borrowed
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Overwrite the whole allocation with zeros unless that already happened
    fn zeroize_once(&mut self) {
        if self.zeroed {
            return;
        }

        if self.protectable {
            if let Err(e) = self.set_access(Access::ReadWrite) {
                log::error!(
                    "Cannot make key memory writable for zeroing ({}). Pages stay inaccessible and are leaked.",
                    e
                );
                self.stranded = true;
                self.zeroed = true;
                return;
            }
        }

        // Safety: the allocation spans layout.size() bytes and is writable
        let whole = unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) };
        whole.zeroize();
        self.zeroed = true;
    }

    #[cfg(unix)]
    fn lock_memory(&self) -> KmeResult<()> {
        let result = unsafe { mlock(self.ptr.as_ptr() as *const libc::c_void, self.layout.size()) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(ENOMEM) {
                return Err(KmeError::memory_error(
                    "mlock",
                    "Exceeded maximum amount of lockable memory",
                    error_codes::MEMORY_PROTECTION_FAILED,
                ));
            }
            return Err(KmeError::memory_error(
                "mlock",
                &format!("Failed to lock memory: {}", err),
                error_codes::MEMORY_PROTECTION_FAILED,
            ));
        }

        Ok(())
    }

    #[cfg(windows)]
    fn lock_memory(&self) -> KmeResult<()> {
        let result = unsafe {
            VirtualLock(self.ptr.as_ptr() as *mut winapi::ctypes::c_void, self.layout.size())
        };

        if result == 0 {
            let err = std::io::Error::last_os_error();
            return Err(KmeError::memory_error(
                "VirtualLock",
                &format!("Failed to lock memory: {}", err),
                error_codes::MEMORY_PROTECTION_FAILED,
            ));
        }

        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn lock_memory(&self) -> KmeResult<()> {
        Err(KmeError::memory_error(
            "memory locking",
            "Memory locking is not supported on this platform",
            error_codes::MEMORY_PROTECTION_FAILED,
        ))
    }

    #[cfg(unix)]
    fn unlock_memory(&self) {
        if self.locked {
            unsafe {
                munlock(self.ptr.as_ptr() as *const libc::c_void, self.layout.size());
            }
        }
    }

    #[cfg(windows)]
    fn unlock_memory(&self) {
        if self.locked {
            unsafe {
                VirtualUnlock(self.ptr.as_ptr() as *mut winapi::ctypes::c_void, self.layout.size());
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn unlock_memory(&self) {}

    #[cfg(unix)]
    fn set_access(&self, access: Access) -> KmeResult<()> {
        if !self.protectable {
            return Ok(());
        }

        let prot = match access {
            Access::NoAccess => PROT_NONE,
            Access::ReadOnly => PROT_READ,
            Access::ReadWrite => PROT_READ | PROT_WRITE,
        };
        let result =
            unsafe { mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.layout.size(), prot) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            return Err(KmeError::memory_error(
                "mprotect",
                &format!("Failed to change page protection: {}", err),
                error_codes::MEMORY_PROTECTION_FAILED,
            ));
        }

        Ok(())
    }

    #[cfg(windows)]
    fn set_access(&self, access: Access) -> KmeResult<()> {
        if !self.protectable {
            return Ok(());
        }

        let flags = match access {
            Access::NoAccess => PAGE_NOACCESS,
            Access::ReadOnly => PAGE_READONLY,
            Access::ReadWrite => PAGE_READWRITE,
        };
        let mut previous = 0;
        let result = unsafe {
            VirtualProtect(
                self.ptr.as_ptr() as *mut winapi::ctypes::c_void,
                self.layout.size(),
                flags,
                &mut previous,
            )
        };

        if result == 0 {
            let err = std::io::Error::last_os_error();
            return Err(KmeError::memory_error(
                "VirtualProtect",
                &format!("Failed to change page protection: {}", err),
                error_codes::MEMORY_PROTECTION_FAILED,
            ));
        }

        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn set_access(&self, _access: Access) -> KmeResult<()> {
        if !self.protectable {
            return Ok(());
        }
        Err(KmeError::memory_error(
            "page protection",
            "Page protection is not supported on this platform",
            error_codes::MEMORY_PROTECTION_FAILED,
        ))
    }
}

impl Drop for LockedPages {
    fn drop(&mut self) {
        self.zeroize_once();
        if self.stranded {
            return;
        }

        self.unlock_memory();

        // Safety: ptr was allocated with this layout and is writable again
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    if info.dwPageSize > 0 {
        info.dwPageSize as usize
    } else {
        4096
    }
}

#[cfg(not(any(unix, windows)))]
fn page_size() -> usize {
    4096
}

/// Opaque container holding exactly `len()` bytes of secret key material
///
/// The buffer starts in [`BufferState::Protected`]. [`borrow`](Self::borrow)
/// moves it to [`BufferState::Borrowed`] and hands out a [`KeyBorrow`];
/// returning or dropping the handle moves it back. [`release`](Self::release)
/// consumes the buffer and zeroes its memory. Dropping the buffer on any other
/// path (early return, error propagation, panic unwinding) zeroes it as well.
///
/// The buffer is `Send` but not `Sync`: it may move to another thread, but it
/// cannot be borrowed from two threads at once.
pub struct SecureKeyBuffer {
    pages: LockedPages,
    state: Cell<BufferState>,
}

impl SecureKeyBuffer {
    /// Allocate a protected buffer of `len` bytes and let `init` fill it
    ///
    /// The closure sees writable memory once; afterwards the buffer is sealed.
    /// If `init` fails, the partially written memory is zeroed and freed.
    pub fn try_new_with<F>(len: usize, init: F) -> KmeResult<Self>
    where
        F: FnOnce(&mut [u8]) -> KmeResult<()>,
    {
        let mut pages = LockedPages::new(len)?;
        init(pages.as_mut_slice())?;
        pages.seal();

        Ok(Self {
            pages,
            state: Cell::new(BufferState::Protected),
        })
    }

    /// Copy `bytes` into a new protected buffer
    ///
    /// The caller remains responsible for zeroing its own copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> KmeResult<Self> {
        Self::try_new_with(bytes.len(), |dst| {
            dst.copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Number of key bytes held by the buffer
    pub fn len(&self) -> usize {
        self.pages.len
    }

    /// Always false: empty key buffers cannot be constructed
    pub fn is_empty(&self) -> bool {
        self.pages.len == 0
    }

    pub fn state(&self) -> BufferState {
        self.state.get()
    }

    /// Whether the backing pages are locked in RAM
    pub fn is_locked(&self) -> bool {
        self.pages.locked
    }

    /// Borrow read-only access to the key bytes
    ///
    /// Fails with `AlreadyBorrowed` while another [`KeyBorrow`] is outstanding.
    pub fn borrow(&self) -> KmeResult<KeyBorrow<'_>> {
        self.begin_borrow("borrow")?;
        Ok(KeyBorrow {
            buffer: self,
            returned: false,
        })
    }

    /// Overwrite the key bytes with zeros and free the memory
    ///
    /// Taking `self` by value means no [`KeyBorrow`] can be alive at this point.
    pub fn release(mut self) {
        self.wipe();
    }

    /// Protected → Borrowed; returns the readable bytes
    pub(crate) fn begin_borrow(&self, operation: &str) -> KmeResult<&[u8]> {
        match self.state.get() {
            BufferState::Borrowed => Err(KmeError::already_borrowed(operation)),
            BufferState::Released => Err(KmeError::invalid_argument(
                "buffer",
                "an unreleased key buffer",
                "a released key buffer",
            )),
            BufferState::Protected => {
                self.pages.set_access(Access::ReadOnly)?;
                self.state.set(BufferState::Borrowed);
                Ok(self.pages.as_slice())
            }
        }
    }

    /// Borrowed → Protected
    pub(crate) fn end_borrow(&self) -> KmeResult<()> {
        if self.state.get() != BufferState::Borrowed {
            return Err(KmeError::invalid_argument(
                "borrow",
                "an outstanding borrow",
                "no outstanding borrow",
            ));
        }

        if let Err(e) = self.pages.set_access(Access::NoAccess) {
            log::warn!("Failed to re-protect key memory after borrow: {}", e);
        }
        self.state.set(BufferState::Protected);
        Ok(())
    }

    fn wipe(&mut self) {
        self.pages.zeroize_once();
        self.state.set(BufferState::Released);
    }
}

impl Drop for SecureKeyBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for SecureKeyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureKeyBuffer")
            .field("len", &self.len())
            .field("state", &self.state())
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Temporary, non-owning read access to the bytes of a [`SecureKeyBuffer`]
///
/// Dereferences to `[u8]`. Call [`return_borrow`](Self::return_borrow) as soon
/// as the bytes are no longer needed; dropping the handle has the same effect.
pub struct KeyBorrow<'a> {
    buffer: &'a SecureKeyBuffer,
    returned: bool,
}

impl<'a> KeyBorrow<'a> {
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.pages.as_slice()
    }

    /// Give up access and put the buffer back into the protected state
    pub fn return_borrow(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.returned {
            return;
        }
        self.returned = true;
        if let Err(e) = self.buffer.end_borrow() {
            log::warn!("Key borrow returned in unexpected state: {}", e);
        }
    }
}

impl Deref for KeyBorrow<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for KeyBorrow<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Drop for KeyBorrow<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for KeyBorrow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBorrow")
            .field("len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
