//! The on-file heap header.
//!
//! SAFETY & SHARING:
//!
//! The header lives at byte 0 of the backing file and at the base address of
//! the mapping, so every process sharing the file sees one instance at one
//! address. Field discipline:
//!
//! - Identity fields (`magic` through `expected_base`) are written once,
//!   inside open, before the mapping is visible to anyone else, and are
//!   read-only thereafter.
//! - `top` and `end` are atomics: the lock-free bump path advances `top`
//!   with fetch-add and validates against an acquire-load of `end`.
//! - `free_space`, `current_size`, and growth are guarded by the memory
//!   mutex in `extra`.
//! - `extra.fd` and `extra.map_flags` are in-process values, rewritten on
//!   every writable open; the numbers a dead process left behind mean
//!   nothing here.

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, AtomicUsize};

use crate::mutex::SharedMutex;
use crate::options::HeapOptions;

/// Identifies the on-file format.
pub(crate) const MAGIC: u32 = 0x99a1_0f0f;

/// Rejects heap files persisted by a machine with a different pointer width
/// or byte order; the absolute pointers inside would be meaningless here.
pub(crate) const HARDWARE_ID: u32 = usize::BITS | ((cfg!(target_endian = "big") as u32) << 8);

/// Number of free-list size classes.
pub(crate) const FREE_LISTS: usize = 64;

/// Bytes the header occupies at the start of the mapping. The caller's root
/// object begins at exactly this offset.
pub const HEADER_SIZE: usize = mem::size_of::<SharedMemory>();

const PLATFORM_RAW: usize =
    2 * mem::size_of::<libc::pthread_mutex_t>() + 2 * mem::size_of::<libc::c_int>();
const PLATFORM_RESERVED: usize = ((PLATFORM_RAW + 63) & !63) - PLATFORM_RAW;

/// In-process platform state embedded in the header. Only the mutexes are
/// meaningful across processes.
#[repr(C)]
pub(crate) struct PlatformBlock {
    pub(crate) fd: RawFd,
    pub(crate) map_flags: libc::c_int,
    pub(crate) mem_mutex: SharedMutex,
    pub(crate) user_mutex: SharedMutex,
    _reserved: [u8; PLATFORM_RESERVED],
}

/// The heap header: identity, geometry, locks, and free lists. The struct is
/// never constructed by value; it is interpreted in place at the base of the
/// mapping, either freshly zeroed (uninitialized) or carrying the state a
/// previous open persisted.
#[repr(C)]
pub struct SharedMemory {
    pub(crate) magic: u32,
    pub(crate) application_id: u32,
    pub(crate) major_version: u16,
    pub(crate) minor_version: u16,
    pub(crate) hardware_id: u32,
    /// The virtual address this heap must be mapped at.
    pub(crate) expected_base: usize,
    /// Bytes currently mapped; grows monotonically while the file is open.
    pub(crate) current_size: AtomicU64,
    /// Growth ceiling; revisable at runtime.
    pub(crate) max_size: AtomicU64,
    /// Reserved for an inter-process event; never dereferenced.
    #[allow(dead_code)]
    pub(crate) condition: usize,
    /// Bump pointer: next unallocated byte.
    pub(crate) top: AtomicUsize,
    /// One past the last mapped byte.
    pub(crate) end: AtomicUsize,
    /// Free-list heads, one per size class. Guarded by the memory mutex.
    pub(crate) free_space: UnsafeCell<[usize; FREE_LISTS]>,
    pub(crate) extra: PlatformBlock,
}

// All mutation goes through the atomics, the embedded mutexes, or the
// UnsafeCell the memory mutex guards.
unsafe impl Sync for SharedMemory {}

const _: () = assert!(HEADER_SIZE % 64 == 0);
const _: () = assert!(mem::align_of::<SharedMemory>() == 8);

/// Write a fresh header into the zeroed mapping at `map`.
///
/// # Safety
///
/// `map` must point at `len` bytes of writable mapped memory holding an
/// all-zero header, not yet visible to any other process.
pub(crate) unsafe fn initialize(
    map: *mut SharedMemory,
    options: &HeapOptions,
    len: usize,
    fd: RawFd,
    map_flags: libc::c_int,
) -> io::Result<()> {
    let base = map as usize;
    addr_of_mut!((*map).magic).write(MAGIC);
    addr_of_mut!((*map).application_id).write(options.application_id);
    addr_of_mut!((*map).major_version).write(options.major_version);
    addr_of_mut!((*map).minor_version).write(options.minor_version);
    addr_of_mut!((*map).hardware_id).write(HARDWARE_ID);
    addr_of_mut!((*map).expected_base).write(base);
    addr_of_mut!((*map).current_size).write(AtomicU64::new(len as u64));
    addr_of_mut!((*map).max_size).write(AtomicU64::new(options.max_len as u64));
    addr_of_mut!((*map).condition).write(0);
    addr_of_mut!((*map).top).write(AtomicUsize::new(base + HEADER_SIZE));
    addr_of_mut!((*map).end).write(AtomicUsize::new(base + len));
    addr_of_mut!((*map).free_space).write(UnsafeCell::new([0; FREE_LISTS]));
    SharedMutex::init_in_place(addr_of_mut!((*map).extra.mem_mutex))?;
    SharedMutex::init_in_place(addr_of_mut!((*map).extra.user_mutex))?;
    refresh_platform(map, fd, map_flags);
    Ok(())
}

/// Record the in-process file descriptor and map flags so growth and close
/// can reach the backing file. Called on every writable open.
pub(crate) unsafe fn refresh_platform(map: *mut SharedMemory, fd: RawFd, map_flags: libc::c_int) {
    addr_of_mut!((*map).extra.fd).write(fd);
    addr_of_mut!((*map).extra.map_flags).write(map_flags);
}
