//! Open-time configuration: flags, defaults, and the options struct every
//! [`crate::HeapFile`] constructor takes.

use bitflags::bitflags;

/// Virtual address used for the first mapping of a newly created heap when
/// the caller does not pick one. Far above the usual program, heap, and
/// library segments so a `MAP_FIXED` placement there does not clobber
/// anything.
pub const DEFAULT_BASE: usize = 0x1880_0000_0000;

/// Default initial file length in bytes.
pub const DEFAULT_INITIAL_LEN: usize = 16_384;

/// Default growth ceiling in bytes.
pub const DEFAULT_MAX_LEN: usize = 1_000_000;

bitflags! {
    /// How the backing file is created and mapped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        /// Map `MAP_SHARED`: writes reach the file and other processes.
        const SHARED = 1;
        /// Map `MAP_PRIVATE`: writes are copy-on-write and never persisted.
        /// Growth discards the copy-on-write pages.
        const PRIVATE = 2;
        /// Back the heap with an anonymous, immediately-unlinked temporary
        /// file; the path argument is ignored.
        const TEMP = 8;
        /// Truncate an existing file before mapping.
        const CREATE_NEW = 16;
        /// Map `PROT_READ` only. The allocator does not police mutating
        /// calls on a read-only heap; making them is a caller error.
        const READ_ONLY = 32;
    }
}

/// Parameters for opening a heap. Identity fields must match the stored
/// header on reopen; the rest only matter when the heap is first created.
#[derive(Debug, Clone)]
pub struct HeapOptions {
    pub application_id: u32,
    pub major_version: u16,
    pub minor_version: u16,
    /// File length used when the heap is created (or the file is shorter).
    pub initial_len: usize,
    /// Growth ceiling recorded into a newly created header.
    pub max_len: usize,
    pub flags: HeapFlags,
    /// Virtual address for the first mapping of a new heap. Zero lets the
    /// kernel choose. Reopens honour the base stored inside the file.
    pub base: usize,
}

impl HeapOptions {
    pub fn new(application_id: u32, major_version: u16, minor_version: u16) -> Self {
        Self {
            application_id,
            major_version,
            minor_version,
            ..Self::default()
        }
    }
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            application_id: 0,
            major_version: 0,
            minor_version: 0,
            initial_len: DEFAULT_INITIAL_LEN,
            max_len: DEFAULT_MAX_LEN,
            flags: HeapFlags::SHARED,
            base: DEFAULT_BASE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = HeapOptions::default();
        assert_eq!(opts.initial_len, 16_384);
        assert_eq!(opts.max_len, 1_000_000);
        assert_eq!(opts.flags, HeapFlags::SHARED);
        assert_eq!(opts.base, DEFAULT_BASE);
    }

    #[test]
    fn test_flag_values_are_stable() {
        // These are persisted conventions; changing them breaks existing
        // callers' expectations.
        assert_eq!(HeapFlags::SHARED.bits(), 1);
        assert_eq!(HeapFlags::PRIVATE.bits(), 2);
        assert_eq!(HeapFlags::TEMP.bits(), 8);
        assert_eq!(HeapFlags::CREATE_NEW.bits(), 16);
        assert_eq!(HeapFlags::READ_ONLY.bits(), 32);
    }

    #[test]
    fn test_new_sets_identity() {
        let opts = HeapOptions::new(42, 3, 1);
        assert_eq!(opts.application_id, 42);
        assert_eq!(opts.major_version, 3);
        assert_eq!(opts.minor_version, 1);
        assert_eq!(opts.initial_len, DEFAULT_INITIAL_LEN);
    }
}
