//! Validated user-memory access.
//!
//! User addresses arriving in syscall arguments are opaque integers, never
//! dereferenceable pointers. Every transfer first checks the whole range
//! against the calling process's mapped user pages; only then does the
//! copy happen, so a failed validation has no partial side effects.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::address_space::AddressSpace;
use crate::mm::FRAME_SIZE;

/// Copy `dst.len()` bytes in from user address `src`.
pub fn copy_in_bytes(space: &AddressSpace, dst: &mut [u8], src: usize) -> KernelResult<()> {
    if !space.covers_range(src, dst.len()) {
        return Err(KernelError::BadUserAddress { addr: src });
    }
    // SAFETY: the whole source range is mapped in the current address
    // space (checked above) and the kernel sees user pages directly.
    unsafe {
        core::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
    }
    Ok(())
}

/// Copy `src.len()` bytes out to user address `dst`.
pub fn copy_out_bytes(space: &AddressSpace, dst: usize, src: &[u8]) -> KernelResult<()> {
    if !space.covers_range(dst, src.len()) {
        return Err(KernelError::BadUserAddress { addr: dst });
    }
    // SAFETY: destination range is mapped (checked above).
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
    }
    Ok(())
}

/// Copy a NUL-terminated string in from user space.
///
/// Stops at the terminator or after `max - 1` bytes, whichever comes
/// first; the result is always a complete (truncated) string. Running off
/// mapped memory before the terminator fails with no bytes consumed.
pub fn copy_in_string(space: &AddressSpace, src: usize, max: usize) -> KernelResult<String> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut addr = src;
    let limit = max.saturating_sub(1);

    while bytes.len() < limit {
        // Validate a page at a time, then scan within it.
        let page_remaining = FRAME_SIZE - (addr % FRAME_SIZE);
        let chunk_len = page_remaining.min(limit - bytes.len());
        if !space.covers_range(addr, chunk_len.max(1)) {
            return Err(KernelError::BadUserAddress { addr });
        }
        for i in 0..chunk_len {
            // SAFETY: addr + i is inside the validated chunk.
            let byte = unsafe { ((addr + i) as *const u8).read() };
            if byte == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(byte);
        }
        addr += chunk_len;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Copy a user array of `u32` words (argv pointer vectors).
pub fn copy_in_words(space: &AddressSpace, src: usize, count: usize) -> KernelResult<Vec<u32>> {
    let mut raw = alloc::vec![0u8; count * 4];
    copy_in_bytes(space, &mut raw, src)?;
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::{boxed::Box, vec};

    use super::*;

    /// A buffer posing as user memory, with an address space that maps
    /// exactly its pages.
    struct UserBuf {
        data: Box<[u8]>,
        space: AddressSpace,
    }

    impl UserBuf {
        fn new(len: usize) -> Self {
            let data = vec![0u8; len].into_boxed_slice();
            let mut space = AddressSpace::new().unwrap();
            space.map_external_buffer(data.as_ptr() as usize, len);
            Self { data, space }
        }

        fn addr(&self) -> usize {
            self.data.as_ptr() as usize
        }
    }

    #[test]
    fn copy_out_then_in_round_trips() {
        let mut user = UserBuf::new(64);
        copy_out_bytes(&user.space, user.addr(), b"payload").unwrap();
        assert_eq!(&user.data[..7], b"payload");

        let mut back = [0u8; 7];
        copy_in_bytes(&user.space, &mut back, user.addr()).unwrap();
        assert_eq!(&back, b"payload");
        let _ = &mut user;
    }

    #[test]
    fn unmapped_ranges_are_rejected_without_side_effects() {
        let user = UserBuf::new(16);
        // A wild address nowhere near the mapping.
        let mut buf = [0xAAu8; 8];
        let err = copy_in_bytes(&user.space, &mut buf, 0x40_0000);
        assert!(err.is_err());
        assert_eq!(buf, [0xAA; 8]); // destination untouched

        let err = copy_out_bytes(&user.space, 0x40_0000, b"data");
        assert!(err.is_err());
    }

    #[test]
    fn ranges_straddling_the_mapping_edge_fail() {
        let user = UserBuf::new(8);
        // A range that starts inside but runs past the last mapped page
        // must be rejected outright. The buffer occupies part of a page,
        // so probe far beyond the page holding it.
        let far = user.addr() + 0x10_0000;
        let mut buf = [0u8; 4];
        assert!(copy_in_bytes(&user.space, &mut buf, far).is_err());
    }

    #[test]
    fn string_copy_stops_at_nul() {
        let mut user = UserBuf::new(32);
        user.data[..6].copy_from_slice(b"hello\0");
        let s = copy_in_string(&user.space, user.addr(), 32).unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn string_copy_truncates_at_max() {
        let mut user = UserBuf::new(32);
        user.data[..8].copy_from_slice(b"abcdefgh");
        let s = copy_in_string(&user.space, user.addr(), 5).unwrap();
        // max-1 bytes, always terminated.
        assert_eq!(s, "abcd");
    }

    #[test]
    fn word_vectors_decode_little_endian(){
        let mut user = UserBuf::new(16);
        user.data[..8].copy_from_slice(&[1, 0, 0, 0, 0xFF, 0, 0, 0]);
        let words = copy_in_words(&user.space, user.addr(), 2).unwrap();
        assert_eq!(words, [1, 0xFF]);
    }
}
