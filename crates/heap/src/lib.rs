//! Persistent heap: a file-backed allocator mapped at a fixed virtual
//! address.
//!
//! The backing file *is* the heap image. Byte 0 holds the [`SharedMemory`]
//! header, the caller's root object follows immediately after, and every
//! allocation lives at a virtual address recorded in the file. Reopening the
//! file maps it back to the same base, so pointer graphs (strings, vectors,
//! records holding raw addresses of other heap objects) survive process
//! exit without any serialization step. Several processes may map the same
//! file concurrently; the mutexes embedded in the header are process-shared.
//!
//! Persisted files are not portable across machines with a different pointer
//! width, byte order, or address-space layout: pointers are absolute, and the
//! header's hardware id exists to reject such files on open.
//!
//! ```no_run
//! use heap::{HeapFile, HeapOptions, RootData};
//!
//! #[repr(C)]
//! #[derive(Default)]
//! struct Counters {
//!     opens: u64,
//! }
//!
//! # fn main() -> Result<(), heap::HeapError> {
//! let file = HeapFile::open("counters.db", &HeapOptions::new(7, 1, 0))?;
//! let mut root = unsafe { RootData::<Counters>::new(file.data())? };
//! root.opens += 1;
//! # Ok(())
//! # }
//! ```

mod alloc;
mod adapters;
mod errors;
mod header;
mod mapper;
mod mutex;
mod options;
mod platform;
mod root;

pub use adapters::{FastAlloc, GlobalHeapAlloc, HeapAlloc};
pub use alloc::HeapGuard;
pub use errors::HeapError;
pub use header::{SharedMemory, HEADER_SIZE};
pub use mapper::{global, HeapFile};
pub use options::{HeapFlags, HeapOptions, DEFAULT_BASE, DEFAULT_INITIAL_LEN, DEFAULT_MAX_LEN};
pub use root::RootData;
