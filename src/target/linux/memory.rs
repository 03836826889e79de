//! Utility functions to work with memory.

use std::cmp::min;

lazy_static::lazy_static! {
    /// Memory page size from system configuration.
    pub(crate) static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

pub(super) const WORD_SIZE: usize = std::mem::size_of::<libc::c_long>();

/// Part of a transfer that stays within one page of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Chunk {
    /// Remote address.
    pub address: u64,
    /// Offset into the local buffer.
    pub offset: usize,
    pub len: usize,
}

/// Splits `len` bytes at `address` so that each chunk resides in only one memory page.
/// A failed page then fails its own chunk and not the neighbouring ones.
pub(super) fn split_on_page_boundary(address: u64, len: usize, page_size: usize) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut offset = 0;

    while offset < len {
        let remote = address + offset as u64;
        let next_page_distance = page_size - ((page_size - 1) & remote as usize);
        let chunk = min(len - offset, next_page_distance);
        out.push(Chunk {
            address: remote,
            offset,
            len: chunk,
        });
        offset += chunk;
    }
    out
}

/// Word-aligned addresses covering `address..address + len`.
pub(super) fn covering_words(address: u64, len: usize) -> impl Iterator<Item = u64> {
    let mask = !(WORD_SIZE as u64 - 1);
    let first = address & mask;
    let end = address + len as u64;
    (first..end).step_by(WORD_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_follow_pages() {
        let chunks = split_on_page_boundary(0x1ff0, 0x1020, 0x1000);
        assert_eq!(
            chunks,
            vec![
                Chunk {
                    address: 0x1ff0,
                    offset: 0,
                    len: 0x10
                },
                Chunk {
                    address: 0x2000,
                    offset: 0x10,
                    len: 0x1000
                },
                Chunk {
                    address: 0x3000,
                    offset: 0x1010,
                    len: 0x10
                },
            ]
        );
    }

    #[test]
    fn small_reads_stay_whole() {
        let chunks = split_on_page_boundary(0x1000, 8, 0x1000);
        assert_eq!(chunks.len(), 1);
        assert!(split_on_page_boundary(0x1000, 0, 0x1000).is_empty());
    }

    #[test]
    fn words_cover_unaligned_ranges() {
        let words: Vec<u64> = covering_words(0x1003, 8).collect();
        assert_eq!(words, vec![0x1000, 0x1008]);
        let words: Vec<u64> = covering_words(0x1000, 8).collect();
        assert_eq!(words, vec![0x1000]);
    }
}
