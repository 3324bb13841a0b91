// src/agent/spill.rs

//! On-disk persistence of the outbound queue across restarts.
//!
//! At graceful shutdown every still-queued payload is written as a
//! `{length, payload, magic}` record. The save goes to a temp file that is
//! renamed into place at commit, so the load path only ever sees a complete
//! file. The framing words use native byte order; the file never leaves
//! the host it was written on.

use crate::core::TallydError;
use crate::core::protocol::MAX_MSG_SIZE;
use bytes::Bytes;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::warn;

/// Trailing marker validating each spill record.
pub const SPILL_MAGIC: u32 = 0xDEAD_3219;

const SPILL_FILE: &str = "dbd.messages";
const SPILL_TMP: &str = "dbd.messages.tmp";

/// Writes all pending payloads under `dir`, atomically replacing any
/// previous spill file. Returns the number of records written.
pub async fn save(dir: &Path, entries: &[Bytes]) -> Result<usize, TallydError> {
    let tmp = dir.join(SPILL_TMP);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .await?;
    let mut writer = BufWriter::new(file);

    for payload in entries {
        writer
            .write_all(&(payload.len() as u32).to_ne_bytes())
            .await?;
        writer.write_all(payload).await?;
        writer.write_all(&SPILL_MAGIC.to_ne_bytes()).await?;
    }

    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    tokio::fs::rename(&tmp, dir.join(SPILL_FILE)).await?;
    Ok(entries.len())
}

/// Reads the spill file under `dir` back into payloads, in their original
/// order, then unlinks it. A missing file yields an empty list. A record
/// failing length or magic validation aborts the load; whatever was
/// recovered before it is still returned.
pub async fn load(dir: &Path) -> Result<Vec<Bytes>, TallydError> {
    let path = dir.join(SPILL_FILE);
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();

    loop {
        let mut word = [0u8; 4];
        match reader.read_exact(&mut word).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_ne_bytes(word);
        if len > MAX_MSG_SIZE {
            warn!("spill record length {len} out of range, discarding the rest of the file");
            break;
        }

        let mut payload = vec![0u8; len as usize];
        if reader.read_exact(&mut payload).await.is_err() {
            warn!("truncated spill record, discarding the rest of the file");
            break;
        }

        if reader.read_exact(&mut word).await.is_err() || u32::from_ne_bytes(word) != SPILL_MAGIC {
            warn!("spill record failed magic validation, discarding the rest of the file");
            break;
        }

        entries.push(Bytes::from(payload));
    }

    drop(reader);
    tokio::fs::remove_file(&path).await.ok();
    Ok(entries)
}
