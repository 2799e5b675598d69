//! Append-only binary audit log.
//!
//! Record layout: `[ts_ms: u64 native][type: u32 BE][len: u32 BE][payload]`.
//! Rotation renames the live file to `<path>.<suffix>` and reopens fresh;
//! readers see either the old or the new file, never a torn one, as long as
//! `rename(2)` is atomic on the filesystem.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated record at entry {0}")]
    Truncated(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp_ms: u64,
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

struct Inner {
    file: File,
    entry_count: u64,
}

pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditLogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(AuditLog {
            path,
            inner: Mutex::new(Inner {
                file,
                entry_count: 0,
            }),
        })
    }

    pub fn write(&self, msg_type: u32, payload: &[u8]) -> Result<(), AuditLogError> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut inner = self.inner.lock().unwrap();
        inner.file.write_all(&ts.to_ne_bytes())?;
        inner.file.write_all(&msg_type.to_be_bytes())?;
        inner.file.write_all(&(payload.len() as u32).to_be_bytes())?;
        inner.file.write_all(payload)?;
        inner.file.flush()?;
        inner.entry_count += 1;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.lock().unwrap().entry_count
    }

    /// Replays every record in append order. The callback returns `false`
    /// to stop early. Returns the number of records visited.
    pub fn replay(
        &self,
        mut callback: impl FnMut(&AuditEntry) -> bool,
    ) -> Result<u64, AuditLogError> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut count = 0u64;

        loop {
            let mut ts_buf = [0u8; 8];
            match reader.read_exact(&mut ts_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let mut type_buf = [0u8; 4];
            let mut len_buf = [0u8; 4];
            reader
                .read_exact(&mut type_buf)
                .map_err(|_| AuditLogError::Truncated(count))?;
            reader
                .read_exact(&mut len_buf)
                .map_err(|_| AuditLogError::Truncated(count))?;

            let len = u32::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            reader
                .read_exact(&mut payload)
                .map_err(|_| AuditLogError::Truncated(count))?;

            let entry = AuditEntry {
                timestamp_ms: u64::from_ne_bytes(ts_buf),
                msg_type: u32::from_be_bytes(type_buf),
                payload,
            };
            count += 1;
            if !callback(&entry) {
                break;
            }
        }

        Ok(count)
    }

    /// Renames the live file to `<path>.<suffix>` and reopens a fresh one.
    pub fn rotate(&self, suffix: &str) -> Result<(), AuditLogError> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.flush()?;

        let mut rotated = self.path.as_os_str().to_owned();
        rotated.push(".");
        rotated.push(suffix);
        std::fs::rename(&self.path, &rotated)?;

        inner.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }
}
