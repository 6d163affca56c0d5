//! Heap lifecycle: open and validate the backing file, map it at the
//! recorded base, grow the mapping in place, and tear it down.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::{debug, warn};

use crate::errors::HeapError;
use crate::header::{self, SharedMemory, HARDWARE_ID, HEADER_SIZE, MAGIC};
use crate::options::{HeapFlags, HeapOptions};
use crate::platform;

/// Handle on an open heap file.
///
/// `HeapFile` owns no heap data; the heap owns itself (the header *is* the
/// heap). The handle tracks only what is needed to find the mapping and to
/// release the descriptor on close.
#[derive(Debug)]
pub struct HeapFile {
    map: Option<NonNull<SharedMemory>>,
    fd: RawFd,
}

// The mapping is process-wide state; the handle itself carries nothing
// thread-affine.
unsafe impl Send for HeapFile {}
unsafe impl Sync for HeapFile {}

impl HeapFile {
    /// Open or create the heap backed by `path`.
    ///
    /// A new or truncated file is zero-extended to `options.initial_len`,
    /// mapped at `options.base`, and given a fresh header. An existing heap
    /// is remapped to the base and length its header records; its identity
    /// fields must match `options` exactly or the open fails with
    /// [`HeapError::InvalidVersion`].
    pub fn open(path: impl AsRef<Path>, options: &HeapOptions) -> Result<Self, HeapError> {
        if options.flags.contains(HeapFlags::TEMP) {
            return Self::open_temp(options);
        }
        let truncate = options.flags.contains(HeapFlags::CREATE_NEW);
        let file = platform::open_backing_file(path.as_ref(), truncate)?;
        Self::attach(file, options)
    }

    /// Open a heap backed by an anonymous, already-unlinked temporary file.
    /// The heap vanishes when the last descriptor closes.
    pub fn open_temp(options: &HeapOptions) -> Result<Self, HeapError> {
        let file = platform::create_temp_file()?;
        Self::attach(file, options)
    }

    fn attach(file: File, options: &HeapOptions) -> Result<Self, HeapError> {
        if options.initial_len < HEADER_SIZE {
            return Err(HeapError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "initial length smaller than the heap header",
            )));
        }
        let fd = file.as_raw_fd();
        if (file.metadata()?.len() as usize) < options.initial_len {
            platform::extend_file(fd, options.initial_len as u64)?;
        }

        let read_only = options.flags.contains(HeapFlags::READ_ONLY);
        let prot = if read_only {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let shared = if options.flags.contains(HeapFlags::PRIVATE) {
            libc::MAP_PRIVATE
        } else {
            libc::MAP_SHARED
        };
        let fixed_flags = shared | libc::MAP_FIXED;

        // First mapping: at the caller's base, or wherever the kernel likes
        // when no base was requested.
        let first_flags = if options.base == 0 { shared } else { fixed_flags };
        let first = platform::map_at(options.base, options.initial_len, prot, first_flags, fd)
            .map_err(|errno| HeapError::MapFailed {
                addr: options.base,
                errno,
            })?;
        let mut map = first.cast::<SharedMemory>();
        let mut mapped_len = options.initial_len;

        // An existing heap knows where it must live and how big it is;
        // remap if the first guess disagrees.
        let recorded_base = unsafe { (*map.as_ptr()).expected_base };
        let recorded_len =
            unsafe { (*map.as_ptr()).current_size.load(Ordering::Relaxed) } as usize;
        if recorded_base != 0
            && (recorded_base != map.as_ptr() as usize || recorded_len != mapped_len)
        {
            platform::unmap(map.as_ptr() as usize, mapped_len);
            let remapped = platform::map_at(recorded_base, recorded_len, prot, fixed_flags, fd)
                .map_err(|errno| HeapError::MapFailed {
                    addr: recorded_base,
                    errno,
                })?;
            map = remapped.cast();
            mapped_len = recorded_len;
        }

        if unsafe { (*map.as_ptr()).expected_base } != 0 {
            let heap = unsafe { map.as_ref() };
            if heap.magic != MAGIC
                || heap.application_id != options.application_id
                || heap.hardware_id != HARDWARE_ID
                || heap.major_version != options.major_version
                || heap.minor_version != options.minor_version
            {
                platform::unmap(map.as_ptr() as usize, mapped_len);
                return Err(HeapError::InvalidVersion);
            }
            let actual = map.as_ptr() as usize;
            if heap.expected_base != actual {
                // Every persisted pointer would dangle; fail loudly rather
                // than silently relocate.
                let expected = heap.expected_base;
                platform::unmap(actual, mapped_len);
                return Err(HeapError::WrongBase { expected, actual });
            }
            if !read_only {
                unsafe { header::refresh_platform(map.as_ptr(), fd, fixed_flags) };
            }
            debug!("reopened heap at {actual:#x} ({mapped_len} bytes)");
        } else {
            if read_only {
                platform::unmap(map.as_ptr() as usize, mapped_len);
                return Err(HeapError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "read-only open of an uninitialized heap",
                )));
            }
            if let Err(e) = unsafe {
                header::initialize(map.as_ptr(), options, mapped_len, fd, fixed_flags)
            } {
                platform::unmap(map.as_ptr() as usize, mapped_len);
                return Err(e.into());
            }
            debug!(
                "created heap at {:#x} ({mapped_len} of at most {} bytes)",
                map.as_ptr() as usize,
                options.max_len
            );
        }

        let fd = file.into_raw_fd();
        Ok(HeapFile { map: Some(map), fd })
    }

    /// Unmap the heap and close its descriptor. Safe to call on an
    /// already-closed file; also called on drop.
    pub fn close(&mut self) {
        if let Some(map) = self.map.take() {
            // Drop the global handle if it points at this heap.
            let _ = GLOBAL_HEAP.compare_exchange(
                map.as_ptr(),
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            let len = unsafe { map.as_ref() }.current_size.load(Ordering::Relaxed) as usize;
            platform::unmap(map.as_ptr() as usize, len);
            platform::close_fd(self.fd);
            self.fd = -1;
            debug!("closed heap");
        }
    }

    /// True while the heap is mapped and usable.
    pub fn is_open(&self) -> bool {
        self.map.is_some()
    }

    /// The heap itself.
    ///
    /// # Panics
    ///
    /// Panics if the file has been closed.
    pub fn data(&self) -> &SharedMemory {
        match self.map {
            Some(map) => unsafe { map.as_ref() },
            None => panic!("heap file is not open"),
        }
    }

    /// Publish this heap as the process-global default that
    /// [`crate::GlobalHeapAlloc`] resolves. Closing the file retracts the
    /// handle.
    pub fn make_global(&self) {
        if let Some(map) = self.map {
            GLOBAL_HEAP.store(map.as_ptr(), Ordering::Release);
        }
    }
}

impl Drop for HeapFile {
    fn drop(&mut self) {
        self.close();
    }
}

static GLOBAL_HEAP: AtomicPtr<SharedMemory> = AtomicPtr::new(ptr::null_mut());

/// The process-global heap published by [`HeapFile::make_global`], if any.
/// The publisher must keep the file open for as long as anyone may resolve
/// it.
pub fn global() -> Option<&'static SharedMemory> {
    NonNull::new(GLOBAL_HEAP.load(Ordering::Acquire)).map(|p| unsafe { &*p.as_ptr() })
}

impl SharedMemory {
    /// Enlarge the file and the mapping so `new_top` fits, keeping the base
    /// address. Returns `false` when the limit or the OS refuses; the heap
    /// is unchanged in that case. Caller holds the memory mutex.
    pub(crate) unsafe fn grow_to(&self, new_top: usize) -> bool {
        let base = self.base();
        let current = self.current_size.load(Ordering::Relaxed) as usize;
        let max = self.max_size.load(Ordering::Relaxed) as usize;
        if current >= max {
            return false;
        }
        let needed = new_top - base;
        let mut new_len = current + (current >> 1);
        while new_len < max && new_len < needed {
            new_len += new_len >> 1;
        }
        if new_len > max {
            new_len = max;
        }
        if new_len < needed {
            return false;
        }

        let fd = self.extra.fd;
        let map_flags = self.extra.map_flags;
        if fd >= 0 {
            if let Err(e) = platform::extend_file(fd, new_len as u64) {
                warn!("could not extend heap file to {new_len} bytes: {e}");
                return false;
            }
        }

        // The header, including the mutex we are holding, lies inside the
        // range being remapped; the shared file pages keep its bytes intact
        // across the unmap/map pair. Nothing may touch `self` in between.
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        platform::unmap(base, current);
        match platform::map_at(base, new_len, prot, map_flags, fd) {
            Ok(p) if p.as_ptr() as usize == base => {
                self.current_size.store(new_len as u64, Ordering::Relaxed);
                self.end.store(base + new_len, Ordering::Release);
                debug!("grew heap from {current} to {new_len} bytes");
                true
            }
            _ => {
                // Fall back to the original range; it was just released, so
                // this placement cannot fail.
                let restored = platform::map_at(base, current, prot, map_flags, fd);
                debug_assert!(matches!(restored, Ok(p) if p.as_ptr() as usize == base));
                warn!("growth to {new_len} bytes refused; heap stays at {current}");
                false
            }
        }
    }
}
