use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::CacheError;

/// SnapshotStore is the persistence seam behind `TtlCache`.
///
/// The cache owns serialization, hashing and validation. A store only
/// moves opaque bytes to and from durable storage, so a flat file can
/// be swapped for an embedded key-value store without touching the
/// cache or its producers.
///
/// CONTRACT:
/// - `load` returns `Ok(None)` when nothing has been persisted yet
/// - `store` replaces the previous snapshot as a whole
///
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {

    /// Human readable location, used only for logging.
    fn describe(&self) -> String;

    /// Reads the last persisted snapshot, if any.
    async fn load(&self) -> Result<Option<Vec<u8>>, CacheError>;

    /// Persists a full snapshot.
    async fn store(&self, bytes: &[u8]) -> Result<(), CacheError>;
}

/// Flat JSON file on local disk.
///
/// Writes go to `<path>.tmp` first and are renamed over the target,
/// so a crash mid-write leaves the previous snapshot intact.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verifies the cache file can be opened for append, creating it
    /// (and its parent directory) if needed.
    pub async fn ensure_accessible(&self) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait::async_trait]
impl SnapshotStore for FileStore {

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, bytes: &[u8]) -> Result<(), CacheError> {
        let tmp = self.temp_path();

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
