use tallyd::core::TallydError;
use tallyd::core::protocol::PackBuf;
use tallyd::core::protocol::buffer::NULL_STR_LEN;

#[test]
fn test_integer_round_trip() {
    let mut buf = PackBuf::with_capacity(32);
    buf.pack_u8(0xAB);
    buf.pack_u16(0xBEEF);
    buf.pack_u32(0xDEAD_BEEF);
    buf.pack_u64(0x0123_4567_89AB_CDEF);
    buf.pack_time(1_700_000_000);

    let bytes = buf.into_bytes();
    let mut buf = PackBuf::from_bytes(&bytes);
    assert_eq!(buf.unpack_u8().unwrap(), 0xAB);
    assert_eq!(buf.unpack_u16().unwrap(), 0xBEEF);
    assert_eq!(buf.unpack_u32().unwrap(), 0xDEAD_BEEF);
    assert_eq!(buf.unpack_u64().unwrap(), 0x0123_4567_89AB_CDEF);
    assert_eq!(buf.unpack_time().unwrap(), 1_700_000_000);
    assert_eq!(buf.remaining(), 0);
}

#[test]
fn test_integers_are_big_endian() {
    let mut buf = PackBuf::with_capacity(8);
    buf.pack_u16(0x0102);
    buf.pack_u32(0x0304_0506);
    let bytes = buf.into_bytes();
    assert_eq!(&bytes[..], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
}

#[test]
fn test_null_string_distinct_from_empty() {
    let mut buf = PackBuf::with_capacity(16);
    buf.pack_str(None);
    buf.pack_str(Some(""));
    buf.pack_str(Some("hello"));

    let bytes = buf.into_bytes();
    assert_eq!(&bytes[..4], &NULL_STR_LEN.to_be_bytes());

    let mut buf = PackBuf::from_bytes(&bytes);
    assert_eq!(buf.unpack_str().unwrap(), None);
    assert_eq!(buf.unpack_str().unwrap(), Some(String::new()));
    assert_eq!(buf.unpack_str().unwrap(), Some("hello".to_string()));
}

#[test]
fn test_unpack_short_on_truncated_integer() {
    let mut buf = PackBuf::from_bytes(&[0x01, 0x02, 0x03]);
    assert!(matches!(buf.unpack_u32(), Err(TallydError::UnpackShort)));
    // A failed read must not consume anything.
    assert_eq!(buf.offset(), 0);
    assert_eq!(buf.unpack_u16().unwrap(), 0x0102);
}

#[test]
fn test_string_length_never_trusted() {
    // Claims 100 bytes of string data but carries only 3.
    let mut buf = PackBuf::with_capacity(8);
    buf.pack_u32(100);
    buf.pack_u8(b'a');
    buf.pack_u8(b'b');
    buf.pack_u8(b'c');
    let bytes = buf.into_bytes();

    let mut buf = PackBuf::from_bytes(&bytes);
    assert!(matches!(buf.unpack_str(), Err(TallydError::UnpackShort)));
}

#[test]
fn test_bytes_round_trip() {
    let mut buf = PackBuf::with_capacity(16);
    buf.pack_bytes(&[1, 2, 3, 4]);
    let bytes = buf.into_bytes();

    let mut buf = PackBuf::from_bytes(&bytes);
    assert_eq!(&buf.unpack_bytes().unwrap()[..], &[1, 2, 3, 4]);
}

#[test]
fn test_str_array_round_trip() {
    let items = vec!["one".to_string(), String::new(), "three".to_string()];
    let mut buf = PackBuf::with_capacity(64);
    buf.pack_str_array(&items);
    let bytes = buf.into_bytes();

    let mut buf = PackBuf::from_bytes(&bytes);
    assert_eq!(buf.unpack_str_array().unwrap(), items);
}

#[test]
fn test_str_array_count_never_trusted() {
    // Claims four entries but carries none.
    let mut buf = PackBuf::with_capacity(4);
    buf.pack_u32(4);
    let bytes = buf.into_bytes();

    let mut buf = PackBuf::from_bytes(&bytes);
    assert!(matches!(
        buf.unpack_str_array(),
        Err(TallydError::UnpackShort)
    ));
}

#[test]
fn test_offset_management() {
    let mut buf = PackBuf::with_capacity(8);
    buf.pack_u32(7);
    buf.pack_u32(9);
    let bytes = buf.into_bytes();

    let mut buf = PackBuf::from_bytes(&bytes);
    assert_eq!(buf.unpack_u32().unwrap(), 7);
    assert_eq!(buf.offset(), 4);
    buf.set_offset(0);
    assert_eq!(buf.unpack_u32().unwrap(), 7);
    // Clamped to the end of the data.
    buf.set_offset(1000);
    assert_eq!(buf.remaining(), 0);
}
