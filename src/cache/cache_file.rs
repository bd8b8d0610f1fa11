use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::errors::{CacheError, CacheResult};

/// Append-at-offset byte store backing every range read
#[async_trait]
pub trait CacheFile: Send + Sync {
    /// Write `data` starting at `offset`
    async fn write(&self, data: &[u8], offset: u64) -> CacheResult<()>;

    /// Read up to `length` bytes from `offset`; shorter at end of file
    async fn read(&self, offset: u64, length: usize) -> CacheResult<Vec<u8>>;

    async fn truncate(&self, size: u64) -> CacheResult<()>;

    /// Current length of the file, tracked without touching the disk
    fn current_size(&self) -> u64;

    /// Bytes available on the volume holding the file
    async fn free_space(&self) -> CacheResult<u64>;

    fn path(&self) -> &Path;

    /// Remove the file from disk
    async fn delete(&self) -> CacheResult<()>;
}

/// Cache file on local disk
pub struct DiskCacheFile {
    path: PathBuf,
    handle: Mutex<Option<File>>,
    size: AtomicU64,
}

impl DiskCacheFile {
    /// Open (or create) the cache file at `path` without truncating existing data
    pub fn open(path: impl Into<PathBuf>) -> CacheResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                error!("Cannot open cache file {:?}: {}", path, e);
                CacheError::from(e)
            })?;
        let size = file.metadata()?.len();
        info!("Opened cache file {:?} ({} bytes cached)", path, size);

        Ok(Self {
            path,
            handle: Mutex::new(Some(File::from_std(file))),
            size: AtomicU64::new(size),
        })
    }

    async fn reopen(&self) -> CacheResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|e| {
                error!("Cannot reopen cache file {:?}: {}", self.path, e);
                CacheError::from(e)
            })
    }
}

#[async_trait]
impl CacheFile for DiskCacheFile {
    async fn write(&self, data: &[u8], offset: u64) -> CacheResult<()> {
        let mut guard = self.handle.lock().await;
        if guard.is_none() {
            *guard = Some(self.reopen().await?);
        }
        let Some(file) = guard.as_mut() else {
            return Err(CacheError::Closed);
        };

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| CacheError::from_io(e, data.len() as u64))?;
        file.write_all(data)
            .await
            .map_err(|e| CacheError::from_io(e, data.len() as u64))?;
        file.flush()
            .await
            .map_err(|e| CacheError::from_io(e, data.len() as u64))?;

        self.size
            .fetch_max(offset + data.len() as u64, Ordering::SeqCst);
        debug!("Wrote {} bytes at offset {} to {:?}", data.len(), offset, self.path);
        Ok(())
    }

    async fn read(&self, offset: u64, length: usize) -> CacheResult<Vec<u8>> {
        let mut guard = self.handle.lock().await;
        let Some(file) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::with_capacity(length);
        (&mut *file)
            .take(length as u64)
            .read_to_end(&mut buffer)
            .await?;
        Ok(buffer)
    }

    async fn truncate(&self, size: u64) -> CacheResult<()> {
        let guard = self.handle.lock().await;
        if let Some(file) = guard.as_ref() {
            file.set_len(size).await?;
        }
        self.size.store(size, Ordering::SeqCst);
        info!("Truncated cache file {:?} to {} bytes", self.path, size);
        Ok(())
    }

    fn current_size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    async fn free_space(&self) -> CacheResult<u64> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::task::spawn_blocking(move || fs2::available_space(dir))
            .await
            .map_err(|e| CacheError::Io(Arc::new(std::io::Error::other(e))))?
            .map_err(CacheError::from)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn delete(&self) -> CacheResult<()> {
        let mut guard = self.handle.lock().await;
        guard.take();
        self.size.store(0, Ordering::SeqCst);
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => info!("Deleted cache file {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache file {:?} does not exist, skipping deletion", self.path)
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
