//! Message spool
//!
//! Raw inbound messages are streamed to uniquely named files under the
//! spool directory while a running SHA-256 digest and byte count are
//! maintained. The digest doubles as the queue's idempotency key. Writers
//! enforce a byte ceiling and delete their partial file on abort.

use mailgate_common::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A finished spooled artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolEntry {
    /// File name relative to the spool directory
    pub file_name: String,
    /// Message size in bytes
    pub size: u64,
    /// Hex-encoded SHA-256 of the message bytes
    pub sha256: String,
}

/// Handle to the spool directory
#[derive(Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    /// Open the spool, creating the directory if needed
    pub async fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Spool(format!("failed to create spool directory: {}", e)))?;

        info!(dir = %dir.display(), "Spool initialized");
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stored names are flat file names; anything that could escape the
    /// spool directory is rejected.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(Error::Spool(format!("invalid spool file name: {:?}", name)));
        }
        Ok(self.dir.join(name))
    }

    /// Start writing a new artifact with the given byte ceiling
    pub async fn create_writer(&self, max_bytes: u64) -> Result<SpoolWriter> {
        let file_name = format!("{}.eml", Uuid::now_v7());
        let path = self.dir.join(&file_name);

        let file = fs::File::create(&path)
            .await
            .map_err(|e| Error::Spool(format!("failed to create spool file: {}", e)))?;

        Ok(SpoolWriter {
            path,
            file_name,
            file: Some(BufWriter::new(file)),
            hasher: Sha256::new(),
            written: 0,
            max_bytes,
            finished: false,
        })
    }

    /// Read an artifact; `Ok(None)` when the file no longer exists
    pub async fn try_read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Spool(format!("failed to read spool file: {}", e))),
        }
    }

    /// Delete an artifact; deleting an already-absent file is not an error
    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(file = %name, "Removed spool file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Spool(format!("failed to remove spool file: {}", e))),
        }
    }

    /// Delete artifacts older than `max_age`, regardless of job outcome.
    /// This is the leak safety net behind the worker-side cleanup. Returns
    /// the number deleted.
    pub async fn sweep_older_than(&self, max_age: Duration) -> Result<u64> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Spool(format!("failed to read spool directory: {}", e)))?;

        let mut removed = 0u64;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Error::Spool(format!("failed to read spool directory: {}", e)))?
        {
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping unreadable spool entry");
                    continue;
                }
            };

            let modified = match meta.modified() {
                Ok(t) => t,
                Err(_) => continue,
            };

            if modified <= cutoff {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "Failed to purge spool file")
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, "Purged aged spool files");
        }
        Ok(removed)
    }
}

/// Streaming artifact writer with a running digest and a byte ceiling.
///
/// The caller awaits each `write` before feeding more input, so a fast
/// sender is paced by disk throughput. Dropping the writer without
/// calling [`SpoolWriter::finish`] deletes the file.
pub struct SpoolWriter {
    path: PathBuf,
    file_name: String,
    file: Option<BufWriter<fs::File>>,
    hasher: Sha256,
    written: u64,
    max_bytes: u64,
    finished: bool,
}

impl SpoolWriter {
    /// Append a chunk. Once the cumulative size exceeds the ceiling the
    /// partial file is deleted and `SizeExceeded` is returned; the writer
    /// accepts no further input.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Spool("write after abort".to_string()))?;

        let total = self.written + chunk.len() as u64;
        if total > self.max_bytes {
            self.discard().await;
            return Err(Error::SizeExceeded {
                limit: self.max_bytes,
            });
        }

        if let Err(e) = file.write_all(chunk).await {
            self.discard().await;
            return Err(Error::Spool(format!("spool write failed: {}", e)));
        }

        self.hasher.update(chunk);
        self.written = total;
        Ok(())
    }

    /// Flush and publish the artifact
    pub async fn finish(mut self) -> Result<SpoolEntry> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::Spool("finish after abort".to_string()))?;

        if let Err(e) = file.flush().await {
            self.discard().await;
            return Err(Error::Spool(format!("spool flush failed: {}", e)));
        }

        self.finished = true;
        let sha256 = hex::encode(std::mem::take(&mut self.hasher).finalize());

        debug!(file = %self.file_name, size = self.written, "Spooled message");

        Ok(SpoolEntry {
            file_name: self.file_name.clone(),
            size: self.written,
            sha256,
        })
    }

    /// Abandon the write and delete the partial file
    pub async fn abort(mut self) {
        self.discard().await;
        self.finished = true;
    }

    async fn discard(&mut self) {
        self.file = None;
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial spool file");
            }
        }
    }
}

impl Drop for SpoolWriter {
    fn drop(&mut self) {
        // Abandoned mid-write (session dropped, task cancelled): the
        // partial file must not linger
        if !self.finished && self.file.is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_spool(tmp: &TempDir) -> Spool {
        Spool::open(tmp.path()).await.unwrap()
    }

    fn files_in(tmp: &TempDir) -> usize {
        std::fs::read_dir(tmp.path()).unwrap().count()
    }

    #[tokio::test]
    async fn test_digest_matches_full_stream() {
        let tmp = TempDir::new().unwrap();
        let spool = open_spool(&tmp).await;

        let mut writer = spool.create_writer(1024).await.unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        let entry = writer.finish().await.unwrap();

        assert_eq!(entry.size, 11);
        assert_eq!(entry.sha256, hex::encode(Sha256::digest(b"hello world")));

        let read = spool.try_read(&entry.file_name).await.unwrap().unwrap();
        assert_eq!(read, b"hello world");
    }

    #[tokio::test]
    async fn test_ceiling_deletes_partial_file() {
        let tmp = TempDir::new().unwrap();
        let spool = open_spool(&tmp).await;

        let mut writer = spool.create_writer(10).await.unwrap();
        writer.write(b"12345").await.unwrap();
        let err = writer.write(b"6789012345").await.unwrap_err();
        assert!(matches!(err, Error::SizeExceeded { limit: 10 }));

        drop(writer);
        assert_eq!(files_in(&tmp), 0);
    }

    #[tokio::test]
    async fn test_dropped_writer_removes_file() {
        let tmp = TempDir::new().unwrap();
        let spool = open_spool(&tmp).await;

        let mut writer = spool.create_writer(1024).await.unwrap();
        writer.write(b"partial").await.unwrap();
        assert_eq!(files_in(&tmp), 1);

        drop(writer);
        assert_eq!(files_in(&tmp), 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let spool = open_spool(&tmp).await;

        let mut writer = spool.create_writer(1024).await.unwrap();
        writer.write(b"x").await.unwrap();
        let entry = writer.finish().await.unwrap();

        spool.remove(&entry.file_name).await.unwrap();
        spool.remove(&entry.file_name).await.unwrap();
        assert!(spool.try_read(&entry.file_name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_traversal_names() {
        let tmp = TempDir::new().unwrap();
        let spool = open_spool(&tmp).await;

        assert!(spool.try_read("../outside.eml").await.is_err());
        assert!(spool.remove("a/b.eml").await.is_err());
        assert!(spool.remove("").await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_purges_aged_artifacts() {
        let tmp = TempDir::new().unwrap();
        let spool = open_spool(&tmp).await;

        let mut writer = spool.create_writer(1024).await.unwrap();
        writer.write(b"old").await.unwrap();
        writer.finish().await.unwrap();

        std::thread::sleep(Duration::from_millis(20));

        // Everything on disk is older than a zero max age
        assert_eq!(spool.sweep_older_than(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(files_in(&tmp), 0);

        // A generous max age keeps fresh files
        let mut writer = spool.create_writer(1024).await.unwrap();
        writer.write(b"new").await.unwrap();
        writer.finish().await.unwrap();
        assert_eq!(
            spool
                .sweep_older_than(Duration::from_secs(3600))
                .await
                .unwrap(),
            0
        );
        assert_eq!(files_in(&tmp), 1);
    }
}
