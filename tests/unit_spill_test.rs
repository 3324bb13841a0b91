use bytes::Bytes;
use std::os::unix::fs::PermissionsExt;
use tallyd::agent::spill;
use tallyd::agent::SPILL_MAGIC;
use tempfile::TempDir;

fn payloads(n: u64) -> Vec<Bytes> {
    (0..n)
        .map(|i| Bytes::from(format!("record-{i:04}")))
        .collect()
}

#[tokio::test]
async fn test_save_then_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let entries = payloads(25);

    let written = spill::save(dir.path(), &entries).await.unwrap();
    assert_eq!(written, 25);

    let path = dir.path().join("dbd.messages");
    assert!(path.exists());
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    let recovered = spill::load(dir.path()).await.unwrap();
    assert_eq!(recovered, entries);

    // A successful load consumes the file.
    assert!(!path.exists());
}

#[tokio::test]
async fn test_load_missing_file_is_empty() {
    let dir = TempDir::new().unwrap();
    assert!(spill::load(dir.path()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_save_leaves_no_temp_file() {
    let dir = TempDir::new().unwrap();
    spill::save(dir.path(), &payloads(3)).await.unwrap();
    assert!(!dir.path().join("dbd.messages.tmp").exists());
}

#[tokio::test]
async fn test_save_replaces_previous_spill() {
    let dir = TempDir::new().unwrap();
    spill::save(dir.path(), &payloads(10)).await.unwrap();
    spill::save(dir.path(), &payloads(2)).await.unwrap();
    assert_eq!(spill::load(dir.path()).await.unwrap(), payloads(2));
}

#[tokio::test]
async fn test_corrupt_magic_aborts_load_keeping_prefix() {
    let dir = TempDir::new().unwrap();
    spill::save(dir.path(), &payloads(5)).await.unwrap();

    // Flip a byte inside the second record's magic word.
    let path = dir.path().join("dbd.messages");
    let mut raw = std::fs::read(&path).unwrap();
    let record_len = 4 + "record-0000".len() + 4;
    let second_magic = 2 * record_len - 4;
    raw[second_magic] ^= 0xFF;
    std::fs::write(&path, &raw).unwrap();

    let recovered = spill::load(dir.path()).await.unwrap();
    assert_eq!(recovered, payloads(1));
    // The unreadable remainder is discarded with the file.
    assert!(!path.exists());
}

#[tokio::test]
async fn test_oversize_record_length_aborts_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dbd.messages");

    let mut raw = Vec::new();
    raw.extend_from_slice(&u32::MAX.to_ne_bytes());
    raw.extend_from_slice(b"whatever");
    raw.extend_from_slice(&SPILL_MAGIC.to_ne_bytes());
    std::fs::write(&path, &raw).unwrap();

    assert!(spill::load(dir.path()).await.unwrap().is_empty());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_truncated_tail_aborts_load_keeping_prefix() {
    let dir = TempDir::new().unwrap();
    spill::save(dir.path(), &payloads(3)).await.unwrap();

    let path = dir.path().join("dbd.messages");
    let raw = std::fs::read(&path).unwrap();
    // Cut the last record short, mid-payload.
    std::fs::write(&path, &raw[..raw.len() - 6]).unwrap();

    let recovered = spill::load(dir.path()).await.unwrap();
    assert_eq!(recovered, payloads(2));
}
