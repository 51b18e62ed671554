//! Secure container for key material.
//!
//! Keys never appear in packs; they live in process memory only, inside a
//! [`SecureBytes`] that locks its pages where the OS permits (so the key does
//! not reach swap) and zeroes itself on drop with a compiler-barrier-backed
//! routine. Lock failures are logged, not fatal: running without
//! `CAP_IPC_LOCK` is normal.

use zeroize::Zeroize;

pub struct SecureBytes {
    bytes: Vec<u8>,
    locked: bool,
}

impl SecureBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        let locked = lock_pages(&bytes);
        if !locked && !bytes.is_empty() {
            tracing::debug!(target: "pack.secure", len = bytes.len(),
                "memory lock unavailable; key pages may be swappable");
        }
        Self { bytes, locked }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    /// Borrow the contents. The only way in; there is no owned accessor.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        // Zeroize clears the Vec, so take the page range first; zero while
        // still locked, then release the lock.
        let ptr = self.bytes.as_ptr();
        let len = self.bytes.len();
        self.bytes.zeroize();
        if self.locked {
            unlock_raw(ptr, len);
        }
    }
}

impl std::fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print contents.
        f.debug_struct("SecureBytes")
            .field("len", &self.bytes.len())
            .field("locked", &self.locked)
            .finish()
    }
}

#[cfg(unix)]
fn lock_pages(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    // Best effort; may fail under RLIMIT_MEMLOCK.
    unsafe { libc::mlock(bytes.as_ptr().cast(), bytes.len()) == 0 }
}

#[cfg(unix)]
fn unlock_raw(ptr: *const u8, len: usize) {
    if len > 0 {
        unsafe {
            libc::munlock(ptr.cast(), len);
        }
    }
}

#[cfg(not(unix))]
fn lock_pages(_bytes: &[u8]) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_raw(_ptr: *const u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_contents_by_borrow() {
        let secret = SecureBytes::from_slice(b"0123456789abcdef");
        assert_eq!(secret.expose(), b"0123456789abcdef");
        assert_eq!(secret.len(), 16);
        assert!(!secret.is_empty());
    }

    #[test]
    fn debug_never_prints_contents() {
        let secret = SecureBytes::from_slice(b"super secret key");
        let repr = format!("{secret:?}");
        assert!(!repr.contains("super"));
        assert!(repr.contains("len"));
    }
}
