use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;

/// Process-shared pthread mutex embedded in the mapped heap header.
///
/// The mutex is constructed in place exactly once, when the header is born,
/// and never moves afterwards: every process mapping the file finds it at the
/// same offset and the same virtual address. Lock state lives in the shared
/// file pages, so it survives the unmap/remap pair growth performs.
#[repr(C)]
pub(crate) struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Construct the mutex in place at `slot` with `PTHREAD_PROCESS_SHARED`.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes and must not hold a mutex another
    /// thread or process could currently be blocked on.
    pub(crate) unsafe fn init_in_place(slot: *mut SharedMutex) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_mutex_init((*slot).inner.get(), attr.as_ptr());
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_> {
        self.raw_lock();
        MutexGuard { mutex: self }
    }

    pub(crate) fn raw_lock(&self) {
        unsafe {
            libc::pthread_mutex_lock(self.inner.get());
        }
    }

    pub(crate) fn raw_unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.inner.get());
        }
    }
}

/// Releases the mutex on drop.
pub(crate) struct MutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.raw_unlock();
    }
}
