//! Allocation: size-classed recycling `malloc`/`free`, the lock-free bump
//! path `fast_malloc`, and the heap-wide user lock.

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use tracing::{trace, warn};

use crate::header::{SharedMemory, FREE_LISTS, HEADER_SIZE};

/// Round a request up to the 8-byte granularity the heap allocates in.
#[inline]
fn round_up(size: usize) -> usize {
    (size + 7) & !7
}

/// Walk the size-class schedule 8, 12, 16, 24, 32, 48, 64, 96, ... which
/// starts at the pointer size and grows by half at every other step. Returns
/// the class index and the class's exact size, or `None` when the request
/// exceeds the largest class.
///
/// Callers round requests to an 8-byte multiple first, so the 12-byte class
/// is never actually selected and every selected class size is itself an
/// 8-byte multiple.
fn object_cell(size: usize) -> Option<(usize, usize)> {
    let mut cell = 0;
    let mut cell_size = mem::size_of::<usize>();
    while cell < FREE_LISTS {
        let half = cell_size >> 1;
        if size <= cell_size {
            return Some((cell, cell_size));
        }
        cell += 1;
        cell_size += half;
        if size <= cell_size {
            return Some((cell, cell_size));
        }
        cell += 1;
        cell_size += half;
    }
    None
}

impl SharedMemory {
    #[inline]
    pub(crate) fn base(&self) -> usize {
        self as *const SharedMemory as usize
    }

    /// Address of the first byte of user data, immediately after the header.
    pub fn root(&self) -> *mut u8 {
        (self.base() + HEADER_SIZE) as *mut u8
    }

    /// True while no objects have been allocated: the root object has not
    /// been constructed yet.
    pub fn empty(&self) -> bool {
        self.top.load(Ordering::Acquire) as *mut u8 == self.root()
    }

    /// Bytes of user data bump-allocated so far.
    pub fn size(&self) -> usize {
        self.top.load(Ordering::Acquire) - self.base() - HEADER_SIZE
    }

    /// Bytes still allocatable: the untouched tail of the mapping plus the
    /// growth headroom left under the limit.
    pub fn capacity(&self) -> usize {
        let top = self.top.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        let current = self.current_size.load(Ordering::Relaxed) as usize;
        let max = self.max_size.load(Ordering::Relaxed) as usize;
        end.saturating_sub(top) + max.saturating_sub(current)
    }

    /// Bytes currently mapped.
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// The growth ceiling.
    pub fn limit(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Revise the growth ceiling. Lowering it below the mapped size only
    /// prevents further growth.
    pub fn set_limit(&self, limit: u64) {
        self.max_size.store(limit, Ordering::Relaxed);
    }

    /// Allocate `size` bytes, preferring a recycled block of the same size
    /// class. Returns `None` when the heap cannot be grown to fit the
    /// request.
    ///
    /// A zero-sized request returns the current top of the heap as a
    /// sentinel; such pointers alias each other and must not be
    /// dereferenced.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return NonNull::new(self.top.load(Ordering::Acquire) as *mut u8);
        }
        let rounded = round_up(size);
        let _guard = self.extra.mem_mutex.lock();
        match object_cell(rounded) {
            Some((cell, cell_size)) => {
                let lists = unsafe { &mut *self.free_space.get() };
                let head = lists[cell];
                if head != 0 {
                    lists[cell] = unsafe { *(head as *const usize) };
                    trace!("recycled {cell_size} bytes at {head:#x}");
                    return NonNull::new(head as *mut u8);
                }
                self.bump(cell_size)
            }
            // Beyond the largest class: plain bump, never recycled.
            None => self.bump(rounded),
        }
    }

    /// Advance the bump pointer by `amount` bytes, growing the mapping when
    /// the tail runs out. Caller holds the memory mutex.
    fn bump(&self, amount: usize) -> Option<NonNull<u8>> {
        let old = self.top.fetch_add(amount, Ordering::AcqRel);
        let new_top = old + amount;
        if new_top > self.end.load(Ordering::Acquire) && !unsafe { self.grow_to(new_top) } {
            self.top.fetch_sub(amount, Ordering::AcqRel);
            return None;
        }
        trace!("allocated {amount} bytes at {old:#x}");
        NonNull::new(old as *mut u8)
    }

    /// Return a block to its size class's free list. The block's first word
    /// becomes the list link; nothing is coalesced or handed back to the OS.
    ///
    /// A zero-sized free is a no-op, and a block outside the heap is logged
    /// and ignored: some container paths free stale or foreign pointers and
    /// the heap carries on.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`malloc`](Self::malloc) with the
    /// same `size`, and must not be used after this call.
    pub unsafe fn free(&self, block: NonNull<u8>, size: usize) {
        if size == 0 {
            return;
        }
        let addr = block.as_ptr() as usize;
        if addr < self.base() || addr >= self.end.load(Ordering::Acquire) {
            warn!("free of out-of-range block {addr:#x} ({size} bytes)");
            return;
        }
        let rounded = round_up(size);
        let Some((cell, cell_size)) = object_cell(rounded) else {
            // Oversized blocks came straight off the bump pointer and are
            // never recycled.
            return;
        };
        let _guard = self.extra.mem_mutex.lock();
        let lists = &mut *self.free_space.get();
        *(addr as *mut usize) = lists[cell];
        lists[cell] = addr;
        trace!("freed {cell_size} bytes at {addr:#x}");
    }

    /// Bump-only allocation for blocks that will never be individually
    /// freed. Lock-free on the happy path: one atomic add on the bump
    /// pointer. The memory mutex is taken only when the mapping must grow;
    /// on failure the add is rolled back and `None` returned.
    pub fn fast_malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let rounded = round_up(size);
        let old = self.top.fetch_add(rounded, Ordering::AcqRel);
        let new_top = old + rounded;
        if new_top > self.end.load(Ordering::Acquire) {
            let _guard = self.extra.mem_mutex.lock();
            if new_top > self.end.load(Ordering::Acquire) && !unsafe { self.grow_to(new_top) } {
                self.top.fetch_sub(rounded, Ordering::AcqRel);
                return None;
            }
        }
        NonNull::new(old as *mut u8)
    }

    /// Reset the heap to empty: the bump pointer returns to the root and the
    /// free lists are zeroed. The mapping is not shrunk and no destructors
    /// run.
    ///
    /// # Safety
    ///
    /// Every block and root reference previously handed out must have been
    /// abandoned.
    pub unsafe fn clear(&self) {
        let _guard = self.extra.mem_mutex.lock();
        self.top
            .store(self.base() + HEADER_SIZE, Ordering::Release);
        let lists = &mut *self.free_space.get();
        *lists = [0; FREE_LISTS];
    }

    /// Lock the heap for the caller's own transaction. The core never takes
    /// this mutex. The millisecond hint is accepted for interface
    /// compatibility and ignored; locking blocks until acquired.
    pub fn lock(&self, _ms: u32) -> bool {
        self.extra.user_mutex.raw_lock();
        true
    }

    /// Release the user lock.
    pub fn unlock(&self) {
        self.extra.user_mutex.raw_unlock();
    }

    /// RAII form of [`lock`](Self::lock).
    pub fn lock_guard(&self, ms: u32) -> HeapGuard<'_> {
        self.lock(ms);
        HeapGuard { mem: self }
    }

    /// Reserved: wait on the heap's inter-process event. Not implemented;
    /// always returns `false` immediately.
    pub fn wait(&self, _ms: u32) -> bool {
        false
    }

    /// Reserved: signal the heap's inter-process event. Not implemented.
    pub fn signal(&self) {}
}

/// Holds the user mutex until dropped.
pub struct HeapGuard<'a> {
    mem: &'a SharedMemory,
}

impl Drop for HeapGuard<'_> {
    fn drop(&mut self) {
        self.mem.unlock();
    }
}
