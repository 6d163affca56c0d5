use heap::{HeapError, HeapFile, HeapFlags, HeapOptions, RootData, HEADER_SIZE};
use tempfile::tempdir;

// Each test that maps at a fixed address gets its own corner of the address
// space; tests run in parallel within this binary.
const EMPTY_BASE: usize = 0x1B00_0000_0000;
const VERSION_BASE: usize = 0x1B04_0000_0000;
const REOPEN_BASE: usize = 0x1B08_0000_0000;
const RO_FRESH_BASE: usize = 0x1B0C_0000_0000;
const RO_REOPEN_BASE: usize = 0x1B10_0000_0000;

fn options_at(base: usize, app: u32, major: u16, minor: u16) -> HeapOptions {
    HeapOptions {
        base,
        ..HeapOptions::new(app, major, minor)
    }
}

/// A freshly created heap is empty: no root object yet, zero user bytes,
/// and the root slot sits immediately after the header.
#[test]
fn test_empty_create() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f.db");

    let options = HeapOptions {
        initial_len: 1000,
        max_len: 1000,
        flags: HeapFlags::SHARED | HeapFlags::CREATE_NEW,
        ..options_at(EMPTY_BASE, 0, 0, 0)
    };
    let file = HeapFile::open(&path, &options).unwrap();
    let heap = file.data();

    assert!(file.is_open());
    assert!(heap.empty(), "no root object has been constructed yet");
    assert_eq!(heap.size(), 0);
    assert_eq!(
        heap.root() as usize,
        EMPTY_BASE + HEADER_SIZE,
        "root must sit immediately after the header"
    );
    assert_eq!(heap.current_size(), 1000);
}

/// Reopening with any identity field changed is refused with
/// InvalidVersion; matching identity succeeds.
#[test]
fn test_version_mismatch_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("versioned.db");

    let file = HeapFile::open(&path, &options_at(VERSION_BASE, 0, 0, 0)).unwrap();
    drop(file);

    for bad in [
        options_at(VERSION_BASE, 1, 0, 0),
        options_at(VERSION_BASE, 0, 1, 0),
        options_at(VERSION_BASE, 0, 0, 1),
    ] {
        let err = HeapFile::open(&path, &bad).unwrap_err();
        assert!(
            matches!(err, HeapError::InvalidVersion),
            "identity {}/{}.{} must be rejected, got {err:?}",
            bad.application_id,
            bad.major_version,
            bad.minor_version
        );
    }

    let file = HeapFile::open(&path, &options_at(VERSION_BASE, 0, 0, 0)).unwrap();
    assert!(file.is_open(), "matching identity must reopen fine");
}

#[repr(C)]
#[derive(Default)]
struct Marker {
    value: u64,
}

/// Root data written before close is visible after reopen; truncating with
/// CREATE_NEW births a fresh, empty heap.
#[test]
fn test_reopen_preserves_root_until_truncated() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("marker.db");
    let options = options_at(REOPEN_BASE, 3, 1, 0);

    {
        let file = HeapFile::open(&path, &options).unwrap();
        let mut root = unsafe { RootData::<Marker>::new(file.data()).unwrap() };
        root.value = 10;
    }

    {
        let file = HeapFile::open(&path, &options).unwrap();
        assert!(!file.data().empty());
        let root = unsafe { RootData::<Marker>::new(file.data()).unwrap() };
        assert_eq!(root.value, 10, "root payload must survive the reopen");
    }

    let truncating = HeapOptions {
        flags: HeapFlags::SHARED | HeapFlags::CREATE_NEW,
        ..options
    };
    let file = HeapFile::open(&path, &truncating).unwrap();
    assert!(
        file.data().empty(),
        "CREATE_NEW must wipe the heap back to the uninitialized state"
    );
    let root = unsafe { RootData::<Marker>::new(file.data()).unwrap() };
    assert_eq!(root.value, 0);
}

/// A temp heap needs no path and disappears with its descriptor; two temp
/// heaps never see each other.
#[test]
fn test_temp_heaps_are_independent() {
    let options = HeapOptions {
        flags: HeapFlags::SHARED | HeapFlags::TEMP,
        base: 0,
        ..HeapOptions::new(0, 0, 0)
    };

    let a = HeapFile::open_temp(&options).unwrap();
    let b = HeapFile::open_temp(&options).unwrap();

    let pa = a.data().malloc(64).unwrap();
    unsafe { pa.as_ptr().write_bytes(0xAA, 64) };

    assert!(b.data().empty(), "second temp heap must start empty");
    assert_ne!(
        a.data() as *const _, b.data() as *const _,
        "temp heaps must be distinct mappings"
    );
}

/// Opening an uninitialized heap read-only cannot work: the header could
/// never be written.
#[test]
fn test_read_only_open_of_fresh_heap_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.db");

    let options = HeapOptions {
        flags: HeapFlags::SHARED | HeapFlags::READ_ONLY,
        ..options_at(RO_FRESH_BASE, 0, 0, 0)
    };
    let err = HeapFile::open(&path, &options).unwrap_err();
    assert!(matches!(err, HeapError::Io(_)));
}

/// An initialized heap reopens read-only and exposes its contents.
#[test]
fn test_read_only_reopen_sees_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro2.db");
    let options = options_at(RO_REOPEN_BASE, 0, 0, 0);

    {
        let file = HeapFile::open(&path, &options).unwrap();
        let mut root = unsafe { RootData::<Marker>::new(file.data()).unwrap() };
        root.value = 77;
    }

    let read_only = HeapOptions {
        flags: HeapFlags::SHARED | HeapFlags::READ_ONLY,
        ..options
    };
    let file = HeapFile::open(&path, &read_only).unwrap();
    let root = unsafe { RootData::<Marker>::new(file.data()).unwrap() };
    assert_eq!(root.value, 77);
}
