//! Small helpers shared across the services.

/// Copy into a caller-visible buffer using word-granular stores wherever the
/// destination allows it.
///
/// A bus quirk corrupts sub-word stores to some of the address ranges the
/// host hands us for ioctl outputs, so every write into a caller-supplied
/// buffer goes through this instead of a plain copy: the word-aligned body
/// is stored 32 bits at a time and only the unaligned head and tail fall
/// back to byte stores confined to the destination slice.
pub(crate) fn word_copy(dst: &mut [u8], src: &[u8]) {
    assert!(dst.len() >= src.len());

    let head = dst.as_ptr().align_offset(4).min(src.len());
    dst[..head].copy_from_slice(&src[..head]);

    let body = (src.len() - head) & !3;
    let mut off = head;
    while off < head + body {
        let word = u32::from_ne_bytes(src[off..off + 4].try_into().unwrap());
        dst[off..off + 4].copy_from_slice(&word.to_ne_bytes());
        off += 4;
    }

    dst[off..src.len()].copy_from_slice(&src[off..]);
}

/// Length of a NUL-terminated string inside `buf`, or `None` when no
/// terminator exists within the buffer.
pub(crate) fn cstr_len(buf: &[u8]) -> Option<usize> {
    memchr::memchr(0, buf)
}

/// Borrow the NUL-terminated prefix of `buf` as UTF-8, if both hold.
pub(crate) fn cstr(buf: &[u8]) -> Option<&str> {
    let len = cstr_len(buf)?;
    std::str::from_utf8(&buf[..len]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_copy_matches_memcpy() {
        let src: Vec<u8> = (0..64).collect();
        for shift in 0..4 {
            for len in [0usize, 1, 3, 4, 5, 31, 32, 33, 60] {
                let mut dst = vec![0u8; 68];
                word_copy(&mut dst[shift..shift + len], &src[..len]);
                assert_eq!(&dst[shift..shift + len], &src[..len]);
            }
        }
    }

    #[test]
    fn cstr_terminated() {
        assert_eq!(cstr(b"/dev/fs\0junk"), Some("/dev/fs"));
        assert_eq!(cstr(b"no terminator"), None);
        assert_eq!(cstr_len(b"\0"), Some(0));
    }
}
