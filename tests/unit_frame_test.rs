use bytes::{Bytes, BytesMut};
use tallyd::core::TallydError;
use tallyd::core::protocol::{FrameCodec, MAX_MSG_SIZE};
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn test_encode_decode_round_trip() {
    let payload = Bytes::from_static(b"\x05\x7espayload");
    let mut wire = BytesMut::new();
    FrameCodec.encode(payload.clone(), &mut wire).unwrap();

    assert_eq!(&wire[..4], &(payload.len() as u32).to_be_bytes());

    let decoded = FrameCodec.decode(&mut wire).unwrap().unwrap();
    assert_eq!(decoded, payload);
    assert!(wire.is_empty());
}

#[test]
fn test_decode_waits_for_complete_header() {
    let mut wire = BytesMut::from(&[0u8, 0, 0][..]);
    assert!(FrameCodec.decode(&mut wire).unwrap().is_none());
}

#[test]
fn test_decode_waits_for_complete_body() {
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&10u32.to_be_bytes());
    wire.extend_from_slice(&[1, 2, 3]);
    assert!(FrameCodec.decode(&mut wire).unwrap().is_none());

    wire.extend_from_slice(&[4, 5, 6, 7, 8, 9, 10]);
    let decoded = FrameCodec.decode(&mut wire).unwrap().unwrap();
    assert_eq!(decoded.len(), 10);
}

#[test]
fn test_undersized_frame_rejected() {
    // A one-byte payload cannot even carry the kind code.
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&1u32.to_be_bytes());
    wire.extend_from_slice(&[0xFF]);
    assert!(matches!(
        FrameCodec.decode(&mut wire),
        Err(TallydError::BadFrameLength(1))
    ));
}

#[test]
fn test_oversized_frame_rejected() {
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&(MAX_MSG_SIZE + 1).to_be_bytes());
    assert!(matches!(
        FrameCodec.decode(&mut wire),
        Err(TallydError::BadFrameLength(_))
    ));
}

#[test]
fn test_encode_rejects_out_of_range_payloads() {
    let mut wire = BytesMut::new();
    assert!(matches!(
        FrameCodec.encode(Bytes::from_static(b"x"), &mut wire),
        Err(TallydError::BadFrameLength(1))
    ));
}

#[test]
fn test_two_frames_in_one_buffer() {
    let mut wire = BytesMut::new();
    FrameCodec.encode(Bytes::from_static(b"aa"), &mut wire).unwrap();
    FrameCodec.encode(Bytes::from_static(b"bbb"), &mut wire).unwrap();

    assert_eq!(FrameCodec.decode(&mut wire).unwrap().unwrap().len(), 2);
    assert_eq!(FrameCodec.decode(&mut wire).unwrap().unwrap().len(), 3);
    assert!(FrameCodec.decode(&mut wire).unwrap().is_none());
}
