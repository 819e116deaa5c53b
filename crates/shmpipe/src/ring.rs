//! Pure ring-geometry and copy helpers, kept free of any driver/ioctl
//! concerns so they're easy to property-test in isolation.

/// Bytes free to write, given a ring of `cap` usable slots (the one-slot
/// gap of Invariant I4 is already baked into `cap` by the caller).
pub fn free_to_write(write_pos: u32, read_pos: u32, cap: u32) -> u32 {
    let used = used_bytes(write_pos, read_pos, cap);
    cap - 1 - used
}

/// Bytes available to read.
pub fn used_bytes(write_pos: u32, read_pos: u32, cap: u32) -> u32 {
    if write_pos >= read_pos {
        write_pos - read_pos
    } else {
        cap - read_pos + write_pos
    }
}

pub fn advance(pos: u32, by: u32, cap: u32) -> u32 {
    let sum = pos as u64 + by as u64;
    (sum % cap as u64) as u32
}

/// Copy `src` into the ring buffer `dst` (length `cap`) starting at
/// `pos`, wrapping as needed. `src.len()` must not exceed
/// `free_to_write(...)`.
pub fn copy_into_ring(dst: &mut [u8], pos: u32, src: &[u8]) {
    let cap = dst.len();
    let pos = pos as usize;
    let first = core::cmp::min(src.len(), cap - pos);
    fast_copy(&mut dst[pos..pos + first], &src[..first]);
    if first < src.len() {
        fast_copy(&mut dst[..src.len() - first], &src[first..]);
    }
}

/// Copy out of the ring buffer `src` starting at `pos` into `dst`.
pub fn copy_from_ring(src: &[u8], pos: u32, dst: &mut [u8]) {
    let cap = src.len();
    let pos = pos as usize;
    let first = core::cmp::min(dst.len(), cap - pos);
    fast_copy(&mut dst[..first], &src[pos..pos + first]);
    if first < dst.len() {
        fast_copy(&mut dst[first..], &src[..dst.len() - first]);
    }
}

/// Byte copy that takes an 8-byte-at-a-time path when both slices are
/// 8-byte aligned and long enough to benefit, falling back to a plain
/// byte-wise copy otherwise (spec.md §4.2's "aligned fast copy").
#[inline]
pub fn fast_copy(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    let len = dst.len();
    if len >= 8
        && (dst.as_ptr() as usize) % 8 == 0
        && (src.as_ptr() as usize) % 8 == 0
    {
        let words = len / 8;
        // SAFETY: alignment and length checked above; the tail below
        // covers the remaining `len % 8` bytes byte-wise.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr() as *const u64,
                dst.as_mut_ptr() as *mut u64,
                words,
            );
        }
        let done = words * 8;
        dst[done..].copy_from_slice(&src[done..]);
    } else {
        dst.copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_when_equal() {
        assert_eq!(used_bytes(5, 5, 16), 0);
        assert_eq!(free_to_write(5, 5, 16), 15);
    }

    #[test]
    fn full_leaves_one_slot_gap() {
        // write one behind read (wrapped) means zero bytes free
        assert_eq!(free_to_write(4, 5, 16), 0);
    }

    #[test]
    fn wraps_correctly() {
        assert_eq!(used_bytes(2, 14, 16), 4);
    }

    #[test]
    fn copy_roundtrip_with_wrap() {
        let mut ring = [0u8; 16];
        let data = b"hello world12345";
        copy_into_ring(&mut ring, 12, &data[..8]);
        let mut out = [0u8; 8];
        copy_from_ring(&ring, 12, &mut out);
        assert_eq!(&out, &data[..8]);
    }
}
