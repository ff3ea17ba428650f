//! Content-preserving object store.
//!
//! Every received object is one file under
//! `<data-root>/storage/studies/<study>/<series>/<instance>`, holding the
//! exact bytes received on the wire: the 128-byte preamble, the `DICM`
//! magic, and the data set. Writes go to a per-worker scratch partition
//! and become visible only through an atomic rename after the file and its
//! directories are durably flushed.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// Size of the fixed DICOM preamble
pub const PREAMBLE_SIZE: usize = 128;

/// The four magic bytes following the preamble
pub const DICM_MAGIC: &[u8; 4] = b"DICM";

/// Minimum size of a storable object: preamble plus magic
pub const MIN_OBJECT_SIZE: u64 = (PREAMBLE_SIZE + DICM_MAGIC.len()) as u64;

const STUDIES_SUBDIR: &str = "storage/studies";
const SCRATCH_SUBDIR: &str = "tmp";

/// Error type for object store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of publishing a scratch file
#[derive(Debug, Clone)]
pub struct Published {
    /// Path relative to the data root, as recorded in the catalog
    pub relative_path: String,
    pub byte_length: u64,
    pub content_hash: String,
    /// True when an identical object was already published
    pub deduplicated: bool,
}

/// Filesystem layout owner for published objects and scratch files
#[derive(Debug, Clone)]
pub struct ObjectStore {
    data_root: PathBuf,
    scratch_dir: PathBuf,
}

impl ObjectStore {
    /// Open (creating if necessary) the store under `data_root`, with a
    /// scratch partition private to `worker_id`.
    pub fn open(data_root: impl Into<PathBuf>, worker_id: &str) -> StoreResult<Self> {
        let data_root = data_root.into();
        let studies = data_root.join(STUDIES_SUBDIR);
        let scratch_dir = data_root.join(SCRATCH_SUBDIR).join(worker_id);
        std::fs::create_dir_all(&studies)?;
        std::fs::create_dir_all(&scratch_dir)?;
        restrict_dir_permissions(&data_root)?;
        restrict_dir_permissions(&studies)?;
        restrict_dir_permissions(&scratch_dir)?;
        Ok(Self {
            data_root,
            scratch_dir,
        })
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Derive the relative path for an instance, validating every UID.
    pub fn relative_path(
        study_uid: &str,
        series_uid: &str,
        instance_uid: &str,
    ) -> StoreResult<String> {
        validate_uid(study_uid)?;
        validate_uid(series_uid)?;
        validate_uid(instance_uid)?;
        Ok(format!(
            "{STUDIES_SUBDIR}/{study_uid}/{series_uid}/{instance_uid}"
        ))
    }

    /// Absolute final path for an instance.
    pub fn instance_path(
        &self,
        study_uid: &str,
        series_uid: &str,
        instance_uid: &str,
    ) -> StoreResult<PathBuf> {
        let relative = Self::relative_path(study_uid, series_uid, instance_uid)?;
        Ok(self.data_root.join(relative))
    }

    /// Resolve a catalog-recorded relative path, refusing anything that
    /// escapes the published tree.
    pub fn resolve(&self, relative: &str) -> StoreResult<PathBuf> {
        if !relative.starts_with(STUDIES_SUBDIR)
            || relative.split('/').any(|c| c.is_empty() || c == "." || c == "..")
        {
            return Err(StoreError::Validation(format!(
                "storage path {relative:?} is outside the published tree"
            )));
        }
        Ok(self.data_root.join(relative))
    }

    /// Open a published object for streaming. Readers may assume
    /// immutability.
    pub async fn read(&self, relative: &str) -> StoreResult<(fs::File, u64)> {
        let path = self.resolve(relative)?;
        let file = fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Read a published object fully into memory. Test and hash support;
    /// the forwarding path streams instead.
    pub async fn read_bytes(&self, relative: &str) -> StoreResult<Vec<u8>> {
        let path = self.resolve(relative)?;
        Ok(fs::read(&path).await?)
    }

    /// Allocate a scratch file in this worker's partition.
    pub async fn begin_scratch(&self) -> StoreResult<ScratchFile> {
        ScratchFile::create(&self.scratch_dir).await
    }

    /// Remove scratch files older than `horizon`, across all worker
    /// partitions. Invoked by the supervisor.
    pub async fn sweep_scratch(&self, horizon: Duration) -> StoreResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(horizon)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let tmp_root = self.data_root.join(SCRATCH_SUBDIR);
        let mut removed = 0usize;

        let mut partitions = match fs::read_dir(&tmp_root).await {
            Ok(rd) => rd,
            Err(_) => return Ok(0),
        };
        while let Some(partition) = partitions.next_entry().await? {
            if !partition.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(partition.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if meta.is_file() && modified < cutoff {
                    match fs::remove_file(entry.path()).await {
                        Ok(()) => {
                            debug!("Swept orphan scratch file {:?}", entry.path());
                            removed += 1;
                        }
                        Err(e) => warn!("Failed to sweep {:?}: {}", entry.path(), e),
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// A scratch file accumulating one object's bytes as they arrive.
///
/// Dropped without `publish` or `discard`, the temporary is unlinked.
pub struct ScratchFile {
    path: PathBuf,
    file: Option<fs::File>,
    hasher: Sha256,
    length: u64,
    finished: bool,
}

impl ScratchFile {
    async fn create(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(Uuid::new_v4().simple().to_string());
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        restrict_file_permissions(&path)?;
        Ok(Self {
            path,
            file: Some(file),
            hasher: Sha256::new(),
            length: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Hash of the bytes appended so far.
    pub fn content_hash(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// Append received bytes exactly as they arrived.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> StoreResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Validation("scratch file already closed".into()))?;
        file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.length += chunk.len() as u64;
        Ok(())
    }

    /// Durably flush and atomically rename into the published tree.
    ///
    /// If the final path already holds identical content the scratch file
    /// is discarded and the publish reports deduplication; differing
    /// content is a conflict and nothing becomes visible.
    pub async fn publish(
        mut self,
        store: &ObjectStore,
        study_uid: &str,
        series_uid: &str,
        instance_uid: &str,
    ) -> StoreResult<Published> {
        if self.length < MIN_OBJECT_SIZE {
            return Err(StoreError::Validation(format!(
                "object of {} byte(s) is shorter than preamble and magic",
                self.length
            )));
        }

        let relative = ObjectStore::relative_path(study_uid, series_uid, instance_uid)?;
        let final_path = store.data_root.join(&relative);
        let content_hash = self.content_hash();

        // The file's bytes must be durable before the rename publishes
        // them.
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        if fs::try_exists(&final_path).await? {
            let existing_hash = hash_file(&final_path).await?;
            if existing_hash == content_hash {
                self.remove().await;
                return Ok(Published {
                    relative_path: relative,
                    byte_length: self.length,
                    content_hash,
                    deduplicated: true,
                });
            }
            return Err(StoreError::Conflict(format!(
                "instance {instance_uid} already published with different content"
            )));
        }

        let series_dir = final_path
            .parent()
            .ok_or_else(|| StoreError::Validation("instance path has no parent".into()))?
            .to_path_buf();
        fs::create_dir_all(&series_dir).await?;
        restrict_dir_permissions(&series_dir)?;
        if let Some(study_dir) = series_dir.parent() {
            restrict_dir_permissions(study_dir)?;
        }

        fs::rename(&self.path, &final_path).await?;
        self.finished = true;

        // Flush the directory entries so the rename survives a crash.
        sync_dir(&series_dir).await;
        if let Some(study_dir) = series_dir.parent() {
            sync_dir(study_dir).await;
        }

        Ok(Published {
            relative_path: relative,
            byte_length: self.length,
            content_hash,
            deduplicated: false,
        })
    }

    /// Unlink the scratch file after a failed transfer.
    pub async fn discard(mut self) {
        self.remove().await;
    }

    async fn remove(&mut self) {
        self.file.take();
        if !self.finished {
            if let Err(e) = fs::remove_file(&self.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove scratch file {:?}: {}", self.path, e);
                }
            }
            self.finished = true;
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.finished {
            let path = self.path.clone();
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete scratch file {:?}: {}", path, e);
                }
            }
        }
    }
}

/// Check the fixed Part-10 prefix: 128 preamble bytes then `DICM`.
pub fn verify_part10_prefix(prefix: &[u8]) -> StoreResult<()> {
    if prefix.len() < PREAMBLE_SIZE + DICM_MAGIC.len() {
        return Err(StoreError::Validation(format!(
            "object too small for preamble and magic ({} byte(s))",
            prefix.len()
        )));
    }
    if &prefix[PREAMBLE_SIZE..PREAMBLE_SIZE + DICM_MAGIC.len()] != DICM_MAGIC {
        return Err(StoreError::Validation(
            "missing DICM magic after preamble".into(),
        ));
    }
    Ok(())
}

/// DICOM UIDs are dot-separated runs of digits, at most 64 characters.
/// Anything else is refused before it can reach the filesystem.
pub fn validate_uid(uid: &str) -> StoreResult<()> {
    if uid.is_empty() || uid.len() > 64 {
        return Err(StoreError::Validation(format!(
            "UID must be 1-64 characters: {uid:?}"
        )));
    }
    let valid = uid
        .split('.')
        .all(|component| !component.is_empty() && component.bytes().all(|b| b.is_ascii_digit()));
    if !valid {
        return Err(StoreError::Validation(format!("malformed UID: {uid:?}")));
    }
    Ok(())
}

/// SHA-256 of a file's contents, streaming in fixed chunks.
pub async fn hash_file(path: &Path) -> StoreResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn sync_dir(path: &Path) {
    if let Ok(dir) = fs::File::open(path).await {
        if let Err(e) = dir.sync_all().await {
            warn!("Failed to fsync directory {:?}: {}", path, e);
        }
    }
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn part10_object(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; PREAMBLE_SIZE];
        data.extend_from_slice(DICM_MAGIC);
        data.extend((0..len).map(|i| (i % 251) as u8));
        data
    }

    async fn store() -> (TempDir, ObjectStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = ObjectStore::open(dir.path(), "worker-test").expect("open store");
        (dir, store)
    }

    #[test]
    fn uid_validation() {
        assert!(validate_uid("1.2.840.10008.1.2").is_ok());
        assert!(validate_uid("1").is_ok());
        assert!(validate_uid("").is_err());
        assert!(validate_uid("..").is_err());
        assert!(validate_uid("1..2").is_err());
        assert!(validate_uid(".1").is_err());
        assert!(validate_uid("1.").is_err());
        assert!(validate_uid("1.2.x").is_err());
        assert!(validate_uid("../../etc/passwd").is_err());
        assert!(validate_uid(&"1.".repeat(33)).is_err());
    }

    #[test]
    fn prefix_verification() {
        assert!(verify_part10_prefix(&part10_object(0)).is_ok());
        assert!(verify_part10_prefix(&[0u8; 131]).is_err());
        let mut bad = part10_object(0);
        bad[130] = b'X';
        assert!(verify_part10_prefix(&bad).is_err());
    }

    #[tokio::test]
    async fn publish_roundtrip_preserves_bytes() {
        let (_dir, store) = store().await;
        let data = part10_object(4096);

        let mut scratch = store.begin_scratch().await.expect("scratch");
        for chunk in data.chunks(1000) {
            scratch.write_chunk(chunk).await.expect("write");
        }
        let published = scratch
            .publish(&store, "1.2.3", "1.2.3.1", "1.2.3.1.1")
            .await
            .expect("publish");

        assert_eq!(published.byte_length, data.len() as u64);
        assert!(!published.deduplicated);

        let bytes = store.read_bytes(&published.relative_path).await.expect("read");
        assert_eq!(bytes, data);
    }

    #[tokio::test]
    async fn duplicate_with_identical_content_is_idempotent() {
        let (_dir, store) = store().await;
        let data = part10_object(512);

        for round in 0..2 {
            let mut scratch = store.begin_scratch().await.expect("scratch");
            scratch.write_chunk(&data).await.expect("write");
            let published = scratch
                .publish(&store, "1.2.3", "1.2.3.1", "1.2.3.1.2")
                .await
                .expect("publish");
            assert_eq!(published.deduplicated, round == 1);
        }
    }

    #[tokio::test]
    async fn duplicate_with_different_content_is_a_conflict() {
        let (_dir, store) = store().await;

        let mut scratch = store.begin_scratch().await.expect("scratch");
        scratch.write_chunk(&part10_object(100)).await.expect("write");
        scratch
            .publish(&store, "1.2.3", "1.2.3.1", "1.2.3.1.3")
            .await
            .expect("publish");

        let mut scratch = store.begin_scratch().await.expect("scratch");
        scratch.write_chunk(&part10_object(101)).await.expect("write");
        let result = scratch
            .publish(&store, "1.2.3", "1.2.3.1", "1.2.3.1.3")
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // The original content must be untouched.
        let bytes = store
            .read_bytes("storage/studies/1.2.3/1.2.3.1/1.2.3.1.3")
            .await
            .expect("read");
        assert_eq!(bytes, part10_object(100));
    }

    #[tokio::test]
    async fn short_objects_are_rejected() {
        let (_dir, store) = store().await;
        let mut scratch = store.begin_scratch().await.expect("scratch");
        scratch.write_chunk(&[0u8; 64]).await.expect("write");
        let result = scratch.publish(&store, "1", "2", "3").await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn dropped_scratch_is_unlinked() {
        let (_dir, store) = store().await;
        let path;
        {
            let mut scratch = store.begin_scratch().await.expect("scratch");
            scratch.write_chunk(b"partial").await.expect("write");
            path = scratch.path().to_path_buf();
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn sweep_removes_aged_scratch_only() {
        let (_dir, store) = store().await;
        let mut scratch = store.begin_scratch().await.expect("scratch");
        scratch.write_chunk(b"orphan").await.expect("write");
        let orphan_path = scratch.path().to_path_buf();
        // Leak the scratch so the file stays behind like a crashed worker's.
        std::mem::forget(scratch);

        assert!(orphan_path.exists());
        let removed = store.sweep_scratch(Duration::from_secs(3600)).await.expect("sweep");
        assert_eq!(removed, 0);
        assert!(orphan_path.exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = store.sweep_scratch(Duration::ZERO).await.expect("sweep");
        assert_eq!(removed, 1);
        assert!(!orphan_path.exists());
    }

    #[tokio::test]
    async fn resolve_refuses_traversal() {
        let (_dir, store) = store().await;
        assert!(store.resolve("storage/studies/../../etc/passwd").is_err());
        assert!(store.resolve("tmp/worker/abc").is_err());
        assert!(store.resolve("storage/studies/1.2/3.4/5.6").is_ok());
    }
}
