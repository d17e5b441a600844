use bytes::Bytes;

use super::bitfield::Bitfield;
use super::state::PeerPieces;

#[test]
fn test_bitfield_set_clear_count() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has(0));

    bf.set(0);
    assert!(bf.has(0));

    bf.set(99);
    assert!(bf.has(99));

    bf.clear(0);
    assert!(!bf.has(0));

    assert_eq!(bf.count(), 1);
}

#[test]
fn test_bitfield_from_bytes() {
    let bf = Bitfield::from_bytes(Bytes::from_static(&[0x80, 0x00]), 16);
    assert!(bf.has(0));
    assert!(!bf.has(1));
}

#[test]
fn test_bitfield_spare_bits_masked() {
    // 10 pieces, trailing bits of the second byte must be ignored.
    let bf = Bitfield::from_bytes(Bytes::from_static(&[0xFF, 0xFF]), 10);
    assert_eq!(bf.count(), 10);
    assert!(bf.is_full());
    assert!(!bf.has(10));
}

#[test]
fn test_bitfield_full_and_iter() {
    let bf = Bitfield::full(9);
    assert!(bf.is_full());
    assert_eq!(bf.iter().collect::<Vec<_>>(), (0..9).collect::<Vec<_>>());
}

#[test]
fn test_bitfield_out_of_range_is_inert() {
    let mut bf = Bitfield::new(8);
    bf.set(8);
    assert!(!bf.has(8));
    assert_eq!(bf.count(), 0);
}

#[test]
fn test_peer_pieces_bitfield_then_have() {
    let mut pieces = PeerPieces::new(8);
    pieces.set_bitfield(Bitfield::from_bytes(Bytes::from_static(&[0xA0]), 8));
    assert!(pieces.has(0));
    assert!(!pieces.has(1));
    assert!(pieces.has(2));

    pieces.set(1);
    assert!(pieces.has(1));
    assert_eq!(pieces.count(8), 3);
}

#[test]
fn test_peer_pieces_have_none_resets() {
    let mut pieces = PeerPieces::new(4);
    pieces.set_have_all();
    assert!(pieces.has(3));
    pieces.set_have_none();
    assert!(!pieces.has(3));
    assert_eq!(pieces.count(4), 0);
}
