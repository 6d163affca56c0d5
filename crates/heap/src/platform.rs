//! Thin wrappers over the OS primitives the heap needs: file creation and
//! zero-extension, fixed-address mapping, and unmapping. Everything here is
//! Unix; the mapped header additionally embeds process-shared mutexes from
//! [`crate::mutex`].

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

use nix::errno::Errno;

/// Open or create the backing file read/write. `truncate` wipes existing
/// content so the heap is reborn from a zeroed header.
pub(crate) fn open_backing_file(path: &Path, truncate: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(path)
}

/// Create an anonymous heap backing: a `mkstemp` file under `/tmp`, unlinked
/// before anyone else can see it. The descriptor keeps it alive.
pub(crate) fn create_temp_file() -> io::Result<File> {
    let mut template = *b"/tmp/heap-XXXXXX\0";
    let fd = unsafe { libc::mkstemp(template.as_mut_ptr().cast()) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let file = unsafe { File::from_raw_fd(fd) };
    let rc = unsafe { libc::unlink(template.as_ptr().cast()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

/// Extend a file to `new_len` by writing a zero byte at `new_len - 1`. The
/// kernel fills the gap with zeros, which is exactly the uninitialized-header
/// state the mapper expects.
pub(crate) fn extend_file(fd: RawFd, new_len: u64) -> io::Result<()> {
    if new_len == 0 {
        return Ok(());
    }
    let zero = [0u8; 1];
    let written = unsafe {
        libc::pwrite(
            fd,
            zero.as_ptr().cast::<c_void>(),
            1,
            (new_len - 1) as libc::off_t,
        )
    };
    if written != 1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Map `len` bytes of `fd` at `addr` with the given protection and flags.
/// Callers that need exact placement pass `MAP_FIXED` in `flags`; an `addr`
/// of zero (without `MAP_FIXED`) lets the kernel choose.
pub(crate) fn map_at(
    addr: usize,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: RawFd,
) -> Result<NonNull<u8>, Errno> {
    let mapped = unsafe { libc::mmap(addr as *mut c_void, len, prot, flags, fd, 0) };
    if mapped == libc::MAP_FAILED {
        Err(Errno::last())
    } else {
        // mmap never returns null on success.
        Ok(unsafe { NonNull::new_unchecked(mapped.cast()) })
    }
}

pub(crate) fn unmap(addr: usize, len: usize) {
    unsafe {
        libc::munmap(addr as *mut c_void, len);
    }
}

pub(crate) fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
