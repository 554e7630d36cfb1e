use super::*;
use common::PageNo;

fn leaf(block: usize) -> Vec<u8> {
    let mut buf = vec![0u8; block];
    Node::new(&mut buf).init(true, block);
    buf
}

fn sorted_insert(node: &mut Node<&mut Vec<u8>>, key: &[u8], value: &[u8]) {
    let pos = node.search(key).unwrap_err();
    node.insert_record(pos, key, value);
}

#[test]
fn init_sets_header() {
    let mut buf = leaf(4096);
    let node = Node::new(&mut buf);
    assert!(node.is_leaf());
    assert!(node.is_dirty());
    assert_eq!(node.filled(), 0);
    assert_eq!(node.kv_last_pos(), 4096);
}

#[test]
fn records_stay_sorted_regardless_of_insert_order() {
    let mut buf = leaf(4096);
    let mut node = Node::new(&mut buf);
    for key in [b"pear" as &[u8], b"apple", b"zebra", b"mango", b"fig"] {
        sorted_insert(&mut node, key, b"v");
    }
    assert_eq!(node.filled(), 5);
    for i in 1..node.filled() {
        assert!(node.key_at(i - 1) < node.key_at(i));
    }
    assert_eq!(node.search(b"mango"), Ok(2));
    assert_eq!(node.search(b"grape"), Err(2));
}

#[test]
fn value_round_trip_with_boundary_lengths() {
    let mut buf = leaf(4096);
    let mut node = Node::new(&mut buf);
    let long_key = vec![b'k'; 255];
    let long_val = vec![b'v'; 255];
    sorted_insert(&mut node, b"", b"");
    sorted_insert(&mut node, b"a", &[7]);
    sorted_insert(&mut node, &long_key, &long_val);

    assert_eq!(node.value_at(node.search(b"").unwrap()), b"");
    assert_eq!(node.value_at(node.search(b"a").unwrap()), &[7]);
    assert_eq!(node.value_at(node.search(&long_key).unwrap()), &long_val[..]);
    assert_eq!(node.max_key_len(), 255);
}

#[test]
fn full_test_tracks_remaining_space() {
    let block = 256;
    let mut buf = leaf(block);
    let mut node = Node::new(&mut buf);
    let mut n = 0u32;
    while !node.is_full(4, 4) {
        let key = format!("k{:03}", n);
        sorted_insert(&mut node, key.as_bytes(), b"vvvv");
        n += 1;
    }
    // every entry costs 10 record bytes plus a 2-byte offset
    assert_eq!(n as usize, (block - NODE_HEADER - 12) / 12 + 1);
    // the offset array never overlaps the record area
    assert!(NODE_HEADER + 2 * node.filled() <= node.kv_last_pos());
}

#[test]
fn remove_then_compact_reclaims_space() {
    let mut buf = leaf(4096);
    let mut node = Node::new(&mut buf);
    for n in 0..10 {
        let key = format!("key{:02}", n);
        sorted_insert(&mut node, key.as_bytes(), b"value");
    }
    let before = node.kv_last_pos();
    node.remove_entry(0);
    node.remove_entry(3);
    assert_eq!(node.filled(), 8);
    // removal alone reclaims nothing
    assert_eq!(node.kv_last_pos(), before);

    node.compact(4096);
    assert_eq!(node.filled(), 8);
    assert_eq!(node.kv_last_pos(), 4096 - 8 * 12);
    assert_eq!(node.search(b"key00"), Err(0));
    assert_eq!(node.value_at(node.search(b"key01").unwrap()), b"value");
    for i in 1..node.filled() {
        assert!(node.key_at(i - 1) < node.key_at(i));
    }
}

#[test]
fn value_at_mut_rewrites_in_place() {
    let mut buf = leaf(4096);
    let mut node = Node::new(&mut buf);
    sorted_insert(&mut node, b"k", b"old");
    node.value_at_mut(0).copy_from_slice(b"new");
    assert_eq!(node.value_at(0), b"new");
}

#[test]
fn child_codec_is_minimal_big_endian() {
    assert_eq!(encode_child(PageNo(0)), vec![0]);
    assert_eq!(encode_child(PageNo(5)), vec![5]);
    assert_eq!(encode_child(PageNo(0x1234)), vec![0x12, 0x34]);
    assert_eq!(encode_child(PageNo(0x0102_0304)), vec![1, 2, 3, 4]);
    for page in [0u32, 1, 255, 256, 65535, 65536, u32::MAX] {
        assert_eq!(decode_child(&encode_child(PageNo(page))), PageNo(page));
    }
}

#[test]
fn mem_io_round_trip() {
    let mut io = MemIo::new();
    io.write_at(8192, &[1, 2, 3, 4]).unwrap();
    assert_eq!(io.len().unwrap(), 8196);

    let mut buf = [0u8; 4];
    assert_eq!(io.read_at(8192, &mut buf).unwrap(), 4);
    assert_eq!(buf, [1, 2, 3, 4]);
    // reads past the end are short
    assert_eq!(io.read_at(8194, &mut buf).unwrap(), 2);
    assert_eq!(io.read_at(9000, &mut buf).unwrap(), 0);
}

#[test]
fn file_io_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocks");
    {
        let mut io = FileIo::open(&path).unwrap();
        io.write_at(4096, b"hello").unwrap();
    }
    let mut io = FileIo::open(&path).unwrap();
    assert_eq!(io.len().unwrap(), 4101);
    let mut buf = [0u8; 5];
    assert_eq!(io.read_at(4096, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
}
