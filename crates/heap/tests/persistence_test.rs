use allocator_api2::alloc::Allocator;
use core::alloc::Layout;
use heap::{HeapAlloc, HeapFile, HeapFlags, HeapOptions, RootData, HEADER_SIZE};
use tempfile::tempdir;

/// Fixed base for the persisted pointer graph; reopens must land here.
const GRAPH_BASE: usize = 0x1A00_0000_0000;

/// The root of the persisted graph: a "vector" of title addresses plus a
/// directly held greeting. All pointers are stored as raw addresses, which
/// is exactly what fixed-base mapping makes durable.
#[repr(C)]
#[derive(Default)]
struct Library {
    title_count: u64,
    titles: usize,
    greeting: usize,
    greeting_len: usize,
}

fn graph_options() -> HeapOptions {
    HeapOptions {
        base: GRAPH_BASE,
        ..HeapOptions::new(7, 1, 0)
    }
}

/// Build a pointer graph through the recycling adapter, close, reopen:
/// every address and every byte must come back unchanged.
#[test]
fn test_pointer_graph_survives_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("library.db");

    let greeting_addr;
    let titles_addr;
    {
        let options = HeapOptions {
            flags: HeapFlags::SHARED | HeapFlags::CREATE_NEW,
            ..graph_options()
        };
        let file = HeapFile::open(&path, &options)?;
        let heap = file.data();
        let alloc = HeapAlloc::new(heap);

        let mut root = unsafe { RootData::<Library>::with(heap, Library::default)? };

        // The greeting string.
        let greeting = alloc
            .allocate(Layout::array::<u8>(5).unwrap())
            .expect("greeting allocation");
        let greeting = greeting.cast::<u8>();
        unsafe { greeting.as_ptr().copy_from_nonoverlapping(b"hello".as_ptr(), 5) };

        // A one-element vector of title pointers.
        let titles = alloc
            .allocate(Layout::array::<usize>(1).unwrap())
            .expect("titles allocation");
        let titles = titles.cast::<usize>();
        unsafe { titles.as_ptr().write(greeting.as_ptr() as usize) };

        greeting_addr = greeting.as_ptr() as usize;
        titles_addr = titles.as_ptr() as usize;

        root.title_count = 1;
        root.titles = titles_addr;
        root.greeting = greeting_addr;
        root.greeting_len = 5;
    }

    // Reopen: same identity, no truncation.
    let file = HeapFile::open(&path, &graph_options())?;
    let heap = file.data();
    assert_eq!(heap as *const _ as usize, GRAPH_BASE);
    assert_eq!(heap.root() as usize, GRAPH_BASE + HEADER_SIZE);
    assert!(!heap.empty());

    let root = unsafe { RootData::<Library>::with(heap, Library::default)? };
    assert_eq!(root.title_count, 1);
    assert_eq!(
        root.titles, titles_addr,
        "the vector must reopen at its original address"
    );
    assert_eq!(root.greeting, greeting_addr);

    // Follow the graph: root -> titles[0] -> greeting bytes.
    let first_title = unsafe { (root.titles as *const usize).read() };
    assert_eq!(
        first_title, greeting_addr,
        "the vector's stored element pointer must equal its original address"
    );
    let bytes = unsafe { std::slice::from_raw_parts(first_title as *const u8, root.greeting_len) };
    assert_eq!(bytes, b"hello");

    Ok(())
}

/// The same options opened twice in a row give byte-identical payloads at
/// identical addresses (round-trip property).
#[test]
fn test_round_trip_is_byte_identical() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("roundtrip.db");
    let options = HeapOptions {
        base: 0x1A08_0000_0000,
        ..HeapOptions::new(9, 0, 3)
    };

    let payload_addr;
    {
        let create = HeapOptions {
            flags: HeapFlags::SHARED | HeapFlags::CREATE_NEW,
            ..options.clone()
        };
        let file = HeapFile::open(&path, &create)?;
        let heap = file.data();
        let p = heap.malloc(128).unwrap();
        for i in 0..128u8 {
            unsafe { p.as_ptr().add(i as usize).write(i.wrapping_mul(37)) };
        }
        payload_addr = p.as_ptr() as usize;
    }

    let file = HeapFile::open(&path, &options)?;
    let bytes = unsafe { std::slice::from_raw_parts(payload_addr as *const u8, 128) };
    for (i, &b) in bytes.iter().enumerate() {
        assert_eq!(b, (i as u8).wrapping_mul(37), "byte {i} must round-trip");
    }
    drop(file);

    Ok(())
}
