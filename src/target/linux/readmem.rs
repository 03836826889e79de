use nix::sys::ptrace;
use nix::unistd::Pid;

use super::memory::{covering_words, split_on_page_boundary, WORD_SIZE, PAGE_SIZE};
use crate::{CoreError, CoreResult};

/// Fills `buf` from the memory of `pid` at `address`.
///
/// Pages are read in one `process_vm_readv` call. Whatever it leaves behind (e.g. pages
/// without read permission) is read word by word with `PTRACE_PEEKDATA`, which needs a
/// stopped tracee.
pub(super) fn read(pid: Pid, address: u64, buf: &mut [u8]) -> CoreResult<()> {
    if buf.is_empty() {
        return Ok(());
    }

    let done = read_process_vm(pid, address, buf).unwrap_or(0);
    if done >= buf.len() {
        return Ok(());
    }

    read_ptrace(pid, address + done as u64, &mut buf[done..])
        .map_err(|_| CoreError::memory(address, buf.len()))
}

/// Reads with one system call. Returns the number of bytes read, counted from the start.
fn read_process_vm(pid: Pid, address: u64, buf: &mut [u8]) -> nix::Result<usize> {
    let chunks = split_on_page_boundary(address, buf.len(), *PAGE_SIZE);
    let base = buf.as_mut_ptr();

    let remote_iov = chunks
        .iter()
        .map(|chunk| libc::iovec {
            iov_base: chunk.address as *mut libc::c_void,
            iov_len: chunk.len,
        })
        .collect::<Vec<_>>();

    // Chunks are disjoint slices of `buf`.
    let local_iov = chunks
        .iter()
        .map(|chunk| libc::iovec {
            iov_base: unsafe { base.add(chunk.offset) } as *mut libc::c_void,
            iov_len: chunk.len,
        })
        .collect::<Vec<_>>();

    let bytes_read = unsafe {
        libc::process_vm_readv(
            pid.into(),
            local_iov.as_ptr(),
            local_iov.len() as libc::c_ulong,
            remote_iov.as_ptr(),
            remote_iov.len() as libc::c_ulong,
            0,
        )
    };

    if bytes_read == -1 {
        return Err(nix::Error::last());
    }
    Ok(bytes_read as usize)
}

/// Allows to read from protected memory pages.
/// This operation results in multiple system calls and is inefficient.
fn read_ptrace(pid: Pid, address: u64, buf: &mut [u8]) -> nix::Result<()> {
    let end = address + buf.len() as u64;

    for word_address in covering_words(address, buf.len()) {
        let word = ptrace::read(pid, word_address as ptrace::AddressType)?.to_ne_bytes();

        // Copy the part of the word that overlaps the requested range.
        let from = address.max(word_address);
        let to = end.min(word_address + WORD_SIZE as u64);
        let src = &word[(from - word_address) as usize..(to - word_address) as usize];
        let dst = (from - address) as usize;
        buf[dst..dst + src.len()].copy_from_slice(src);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn read_own_memory() {
        let var: usize = 52;
        let var2: [u8; 3] = [1, 2, 3];

        let mut out = [0u8; std::mem::size_of::<usize>()];
        read(getpid(), &var as *const _ as u64, &mut out).expect("read failed");
        assert_eq!(usize::from_ne_bytes(out), 52);

        let mut out = [0u8; 3];
        read(getpid(), var2.as_ptr() as u64, &mut out).expect("read failed");
        assert_eq!(out, var2);
    }

    #[test]
    fn read_across_pages() {
        let data: Vec<u8> = (0..3 * *PAGE_SIZE).map(|i| i as u8).collect();
        let mut out = vec![0u8; 2 * *PAGE_SIZE];
        let start = *PAGE_SIZE / 2;
        read(getpid(), data[start..].as_ptr() as u64, &mut out).expect("read failed");
        assert_eq!(out[..], data[start..start + out.len()]);
    }
}
