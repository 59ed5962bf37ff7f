use crate::core::{Result, StateError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{Level, event};

pub const CHECKSUM_FORMAT: &str = "SHA-256";

/// Readable blob body.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Content-addressed blob sink. Blobs are named by the lowercase hex SHA-256
/// of their bytes; `put` verifies the digest before the blob becomes visible.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes read from `source` under `checksum`. Returns the blob size.
    /// Storing identical content twice is a no-op for the second call.
    async fn put(&self, checksum: &str, source: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64>;

    async fn get(&self, checksum: &str) -> Result<BlobReader>;

    async fn contains(&self, checksum: &str) -> Result<bool>;

    /// Returns `false` if there was nothing to delete.
    async fn delete(&self, checksum: &str) -> Result<bool>;
}

pub fn is_valid_checksum(checksum: &str) -> bool {
    checksum.len() == 64 && checksum.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn validate_checksum(checksum: &str) -> Result<()> {
    if is_valid_checksum(checksum) {
        Ok(())
    } else {
        Err(StateError::InvalidInput(format!(
            "'{}' is not a lowercase hex {} digest",
            checksum, CHECKSUM_FORMAT
        )))
    }
}

fn digest_mismatch(expected: &str, actual: &str) -> StateError {
    StateError::InvalidInput(format!(
        "blob content digest {} does not match declared checksum {}",
        actual, expected
    ))
}

// ============================================================================
// In-memory blobs
// ============================================================================

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, checksum: &str, source: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        validate_checksum(checksum)?;
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).await?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != checksum {
            return Err(digest_mismatch(checksum, &actual));
        }
        let size = bytes.len() as u64;
        self.blobs.write().await.entry(checksum.to_string()).or_insert(bytes);
        Ok(size)
    }

    async fn get(&self, checksum: &str) -> Result<BlobReader> {
        let blobs = self.blobs.read().await;
        let bytes = blobs
            .get(checksum)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("blob {}", checksum)))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn contains(&self, checksum: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(checksum))
    }

    async fn delete(&self, checksum: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(checksum).is_some())
    }
}

// ============================================================================
// Filesystem blobs
// ============================================================================

/// Blobs stored as files under `root/<first two hex chars>/<checksum>`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, checksum: &str) -> PathBuf {
        self.root.join(&checksum[..2]).join(checksum)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, checksum: &str, source: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        validate_checksum(checksum)?;
        let final_path = self.blob_path(checksum);
        let fan_out = final_path
            .parent()
            .ok_or_else(|| StateError::Fatal("blob path has no parent".to_string()))?
            .to_path_buf();
        fs::create_dir_all(&fan_out).await?;

        // Stage next to the destination so the final rename stays on one filesystem.
        let (std_file, temp_path) = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&fan_out)?
            .into_parts();
        let mut staged = fs::File::from_std(std_file);

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            staged.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        staged.flush().await?;
        staged.sync_all().await?;
        drop(staged);

        let actual = hex::encode(hasher.finalize());
        if actual != checksum {
            return Err(digest_mismatch(checksum, &actual));
        }
        if fs::try_exists(&final_path).await? {
            event!(Level::DEBUG, checksum, "blob already present");
            return Ok(size);
        }
        temp_path
            .persist(&final_path)
            .map_err(|e| StateError::Io(format!("Failed to publish blob {}: {}", checksum, e.error)))?;
        event!(Level::DEBUG, checksum, size, "blob stored");
        Ok(size)
    }

    async fn get(&self, checksum: &str) -> Result<BlobReader> {
        validate_checksum(checksum)?;
        match fs::File::open(self.blob_path(checksum)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StateError::NotFound(format!("blob {}", checksum)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, checksum: &str) -> Result<bool> {
        validate_checksum(checksum)?;
        Ok(fs::try_exists(self.blob_path(checksum)).await?)
    }

    async fn delete(&self, checksum: &str) -> Result<bool> {
        validate_checksum(checksum)?;
        match fs::remove_file(self.blob_path(checksum)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checksum_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    async fn read_all(mut reader: BlobReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_fs_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        let body = b"archive bytes".to_vec();
        let checksum = checksum_of(&body);

        let size = store.put(&checksum, &mut Cursor::new(body.clone())).await.unwrap();
        assert_eq!(size, body.len() as u64);
        assert!(store.contains(&checksum).await.unwrap());
        assert_eq!(read_all(store.get(&checksum).await.unwrap()).await, body);

        // Identical content is accepted again.
        store.put(&checksum, &mut Cursor::new(body.clone())).await.unwrap();

        assert!(store.delete(&checksum).await.unwrap());
        assert!(!store.delete(&checksum).await.unwrap());
        assert!(store.get(&checksum).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_fs_digest_mismatch_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        let claimed = checksum_of(b"expected");
        let err = store
            .put(&claimed, &mut Cursor::new(b"something else".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidInput(_)));
        assert!(!store.contains(&claimed).await.unwrap());

        let mut fan_out = std::fs::read_dir(dir.path().join(&claimed[..2])).unwrap();
        assert!(fan_out.next().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_validates_checksum() {
        let store = MemoryBlobStore::new();
        let err = store.put("abc", &mut Cursor::new(Vec::new())).await.unwrap_err();
        assert!(matches!(err, StateError::InvalidInput(_)));

        let checksum = checksum_of(b"x");
        store.put(&checksum, &mut Cursor::new(b"x".to_vec())).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(read_all(store.get(&checksum).await.unwrap()).await, b"x".to_vec());
    }
}
