use bytes::Bytes;
use tallyd::core::TallydError;
use tallyd::core::auth::{AuthProvider, Credential, MacAuth};
use tallyd::core::protocol::PackBuf;

#[test]
fn test_credential_round_trip_yields_local_uid() {
    let auth = MacAuth::new(b"shared-key".to_vec());
    let cred = auth.create().unwrap();
    let uid = auth.verify(&cred).unwrap();
    assert_eq!(uid, unsafe { libc::geteuid() } as u32);
}

#[test]
fn test_tampered_credential_rejected() {
    let auth = MacAuth::new(b"shared-key".to_vec());
    let cred = auth.create().unwrap();

    let mut bytes = cred.as_bytes().to_vec();
    bytes[0] ^= 0x01;
    let tampered = Credential::from_bytes(Bytes::from(bytes));
    assert!(matches!(
        auth.verify(&tampered),
        Err(TallydError::AccessDenied)
    ));
}

#[test]
fn test_wrong_key_rejected() {
    let minting = MacAuth::new(b"key-one".to_vec());
    let verifying = MacAuth::new(b"key-two".to_vec());
    let cred = minting.create().unwrap();
    assert!(matches!(
        verifying.verify(&cred),
        Err(TallydError::AccessDenied)
    ));
}

#[test]
fn test_garbage_credential_rejected() {
    let auth = MacAuth::new(b"shared-key".to_vec());
    let cred = Credential::from_bytes(Bytes::from_static(b"not-a-credential"));
    assert!(matches!(auth.verify(&cred), Err(TallydError::AccessDenied)));
}

#[test]
fn test_credential_packs_as_opaque_blob() {
    let auth = MacAuth::new(b"shared-key".to_vec());
    let cred = auth.create().unwrap();

    let mut buf = PackBuf::with_capacity(64);
    cred.pack(&mut buf);
    let bytes = buf.into_bytes();

    let mut buf = PackBuf::from_bytes(&bytes);
    let decoded = Credential::unpack(&mut buf).unwrap();
    assert_eq!(decoded, cred);
    assert!(auth.verify(&decoded).is_ok());
}
