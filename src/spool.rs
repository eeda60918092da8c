//! 上传分片暂存：内存缓冲超过阈值后溢出到临时文件。

use std::io::{self, Cursor, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SPOOL_PREFIX: &str = ".spool.";

/// Removes the spool file when dropped.
#[derive(Debug)]
struct SpoolGuard {
    path: PathBuf,
}

impl Drop for SpoolGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = ?self.path, error = %err, "failed to remove spool file");
        }
    }
}

#[derive(Debug)]
enum Storage {
    Memory(Vec<u8>),
    Disk { file: File, guard: SpoolGuard },
}

/// Bytes of one multipart part, held in memory up to `memory_limit`.
#[derive(Debug)]
pub struct SpooledPart {
    storage: Storage,
    len: u64,
    memory_limit: u64,
    spool_dir: PathBuf,
}

impl SpooledPart {
    pub fn new(spool_dir: &Path, memory_limit: u64) -> Self {
        Self {
            storage: Storage::Memory(Vec::new()),
            len: 0,
            memory_limit,
            spool_dir: spool_dir.to_path_buf(),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.storage, Storage::Disk { .. })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        let next_len = self.len + chunk.len() as u64;
        if let Storage::Memory(buffer) = &mut self.storage {
            if next_len <= self.memory_limit {
                buffer.extend_from_slice(chunk);
                self.len = next_len;
                return Ok(());
            }
            let buffered = std::mem::take(buffer);
            self.spill(&buffered).await?;
        }
        if let Storage::Disk { file, .. } = &mut self.storage {
            file.write_all(chunk).await?;
        }
        self.len = next_len;
        Ok(())
    }

    async fn spill(&mut self, buffered: &[u8]) -> io::Result<()> {
        let path = self
            .spool_dir
            .join(format!("{SPOOL_PREFIX}{}", Uuid::new_v4()));
        let guard = SpoolGuard { path };
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&guard.path)
            .await?;
        file.write_all(buffered).await?;
        debug!(path = ?guard.path, buffered = buffered.len(), "spilled part to disk");
        self.storage = Storage::Disk { file, guard };
        Ok(())
    }

    /// Rewinds and hands out a reader over the stored bytes.
    pub async fn into_reader(self) -> io::Result<SpoolReader> {
        match self.storage {
            Storage::Memory(buffer) => Ok(SpoolReader {
                inner: Box::pin(Cursor::new(buffer)),
                _guard: None,
            }),
            Storage::Disk { mut file, guard } => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Ok(SpoolReader {
                    inner: Box::pin(file),
                    _guard: Some(guard),
                })
            }
        }
    }
}

/// Reader over a spooled part; the backing file lives as long as the reader.
pub struct SpoolReader {
    inner: Pin<Box<dyn AsyncRead + Send>>,
    _guard: Option<SpoolGuard>,
}

impl AsyncRead for SpoolReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

/// 清理过期的暂存文件。
pub async fn cleanup_stale_spool(spool_dir: &Path, ttl: std::time::Duration) -> io::Result<()> {
    if ttl.is_zero() || fs::metadata(spool_dir).await.is_err() {
        return Ok(());
    }

    let now = SystemTime::now();
    let mut dir = fs::read_dir(spool_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(SPOOL_PREFIX) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age >= ttl {
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale spool file");
            } else {
                info!(path = ?path, "removed stale spool file");
            }
        }
    }

    Ok(())
}
