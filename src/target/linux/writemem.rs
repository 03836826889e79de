use log::warn;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

use super::memory::{covering_words, split_on_page_boundary, WORD_SIZE, PAGE_SIZE};
use super::readmem;
use crate::{CoreError, CoreResult};

/// Writes `data` to the memory of `pid` at `address`.
///
/// Writable pages take one `process_vm_writev` call. Write-protected ones (code) are
/// patched word by word with `PTRACE_POKEDATA`. When neither manages the whole range the
/// original bytes are written back and the call fails.
pub(super) fn write(pid: Pid, address: u64, data: &[u8]) -> CoreResult<()> {
    if data.is_empty() {
        return Ok(());
    }

    let mut original = vec![0u8; data.len()];
    readmem::read(pid, address, &mut original)?;

    if let Ok(written) = write_process_vm(pid, address, data) {
        if written == data.len() {
            return Ok(());
        }
    }

    if write_ptrace(pid, address, data).is_err() {
        if write_process_vm(pid, address, &original).ok() != Some(original.len())
            && write_ptrace(pid, address, &original).is_err()
        {
            warn!(
                "failed to roll back a partial write of {} bytes at {:#x}",
                data.len(),
                address
            );
        }
        return Err(CoreError::memory(address, data.len()));
    }
    Ok(())
}

/// Allows to write data to different locations in debuggee's memory as a single operation.
/// It requires a memory page to be writable.
fn write_process_vm(pid: Pid, address: u64, data: &[u8]) -> nix::Result<usize> {
    let chunks = split_on_page_boundary(address, data.len(), *PAGE_SIZE);

    let remote_iov = chunks
        .iter()
        .map(|chunk| libc::iovec {
            iov_base: chunk.address as *mut libc::c_void,
            iov_len: chunk.len,
        })
        .collect::<Vec<_>>();

    let local_iov = chunks
        .iter()
        .map(|chunk| libc::iovec {
            iov_base: data[chunk.offset..].as_ptr() as *mut libc::c_void,
            iov_len: chunk.len,
        })
        .collect::<Vec<_>>();

    let bytes_written = unsafe {
        libc::process_vm_writev(
            pid.into(),
            local_iov.as_ptr(),
            local_iov.len() as libc::c_ulong,
            remote_iov.as_ptr(),
            remote_iov.len() as libc::c_ulong,
            0,
        )
    };

    if bytes_written == -1 {
        return Err(nix::Error::last());
    }
    Ok(bytes_written as usize)
}

/// Allows to write to write-protected pages.
/// On Linux, this will result in multiple system calls and it's inefficient.
fn write_ptrace(pid: Pid, address: u64, data: &[u8]) -> nix::Result<()> {
    let end = address + data.len() as u64;

    for word_address in covering_words(address, data.len()) {
        let from = address.max(word_address);
        let to = end.min(word_address + WORD_SIZE as u64);

        // Partial words keep the target's bytes around the written range.
        let mut word = if to - from == WORD_SIZE as u64 {
            [0u8; WORD_SIZE]
        } else {
            ptrace::read(pid, word_address as ptrace::AddressType)?.to_ne_bytes()
        };
        word[(from - word_address) as usize..(to - word_address) as usize]
            .copy_from_slice(&data[(from - address) as usize..(to - address) as usize]);

        let value = libc::c_long::from_ne_bytes(word);
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                pid.as_raw(),
                word_address as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        };
        Errno::result(res)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn write_own_memory() {
        let mut target = [0u8; 12];
        let data = [0xaa_u8, 0xbb, 0xcc];

        let remote = unsafe { target.as_mut_ptr().add(5) } as u64;
        write(getpid(), remote, &data).expect("write failed");
        let target = unsafe { std::ptr::read_volatile(&target) };
        assert_eq!(target[4..9], [0, 0xaa, 0xbb, 0xcc, 0]);
    }

    #[test]
    fn unmapped_memory_is_an_error() {
        assert!(write(getpid(), 0x8, &[1, 2, 3]).is_err());
    }
}
