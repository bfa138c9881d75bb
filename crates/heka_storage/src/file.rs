//! File-based key-value backend for persistent storage.

use crate::backend::{KvBackend, WriteBatch};
use crate::error::{StorageError, StorageResult};
use crate::memory::apply_ops;
use fs2::FileExt;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes at the start of every snapshot file.
const SNAPSHOT_MAGIC: [u8; 4] = *b"HKV1";
/// Current snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;
/// Length of the trailing SHA-256 checksum.
const CHECKSUM_LEN: usize = 32;

/// A file-based key-value backend.
///
/// The whole key space is kept in memory and persisted as a single snapshot
/// file. Every [`write_batch`](KvBackend::write_batch) rewrites the snapshot
/// with the write-then-rename pattern:
///
/// 1. Write the new snapshot to `<path>.tmp`
/// 2. `fsync` the temporary file
/// 3. Rename it over `<path>`
/// 4. `fsync` the parent directory
///
/// A crash at any point leaves either the old or the new snapshot on disk,
/// never a mix. The snapshot ends with a SHA-256 checksum so torn or
/// tampered files are rejected on open.
///
/// A sibling `<path>.lock` file is held with an exclusive advisory lock for
/// the lifetime of the backend so two processes never write the same store.
///
/// # Example
///
/// ```no_run
/// use heka_storage::{KvBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("heka.kv")).unwrap();
/// backend.put("anchor.steps", b"token").unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    _lock: File,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read, is corrupted, or the
    /// store is locked by another process.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let lock_path = sibling(path, "lock");
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        // A leftover temp file is an interrupted write; the rename never
        // happened, so the snapshot at `path` is still authoritative.
        let temp_path = sibling(path, "tmp");
        if temp_path.exists() {
            tracing::warn!(path = %temp_path.display(), "removing interrupted snapshot write");
            fs::remove_file(&temp_path)?;
        }

        let data = if path.exists() {
            let mut bytes = Vec::new();
            File::open(path)?.read_to_end(&mut bytes)?;
            if bytes.is_empty() {
                BTreeMap::new()
            } else {
                decode_snapshot(&bytes)?
            }
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), keys = data.len(), "opened key-value store");

        Ok(Self {
            path: path.to_path_buf(),
            data: RwLock::new(data),
            _lock: lock,
        })
    }

    /// Opens or creates a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the store cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Self::open(path)
    }

    /// Returns the path to the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn persist(&self, data: &BTreeMap<String, Vec<u8>>) -> StorageResult<()> {
        let temp_path = sibling(&self.path, "tmp");
        let encoded = encode_snapshot(data);

        let mut file = File::create(&temp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Readers block until the snapshot is durable, then see the new map.
        let mut data = self.data.write();
        let mut next = data.clone();
        apply_ops(&mut next, batch.into_ops());
        self.persist(&next)?;
        *data = next;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> StorageResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> StorageResult<()> {
    Ok(())
}

fn encode_snapshot(data: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());

    let count = u32::try_from(data.len()).unwrap_or(u32::MAX);
    buf.extend_from_slice(&count.to_le_bytes());

    for (key, value) in data {
        let key_len = u32::try_from(key.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        let value_len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&value_len.to_le_bytes());
        buf.extend_from_slice(value);
    }

    let checksum = Sha256::digest(&buf);
    buf.extend_from_slice(&checksum);
    buf
}

fn decode_snapshot(bytes: &[u8]) -> StorageResult<BTreeMap<String, Vec<u8>>> {
    if bytes.len() < SNAPSHOT_MAGIC.len() + 2 + 4 + CHECKSUM_LEN {
        return Err(StorageError::Corrupted("snapshot too short".into()));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err(StorageError::Corrupted("snapshot checksum mismatch".into()));
    }

    if body[0..4] != SNAPSHOT_MAGIC {
        return Err(StorageError::Corrupted("invalid snapshot magic".into()));
    }

    let mut reader = Reader { buf: body, pos: 4 };
    let version = u16::from_le_bytes(reader.take_array::<2>()?);
    if version > SNAPSHOT_VERSION {
        return Err(StorageError::Corrupted(format!(
            "unsupported snapshot version: {version}"
        )));
    }

    let count = u32::from_le_bytes(reader.take_array::<4>()?);
    let mut data = BTreeMap::new();
    for _ in 0..count {
        let key_len = u32::from_le_bytes(reader.take_array::<4>()?) as usize;
        let key = String::from_utf8(reader.take(key_len)?.to_vec())
            .map_err(|_| StorageError::Corrupted("key is not valid UTF-8".into()))?;
        let value_len = u32::from_le_bytes(reader.take_array::<4>()?) as usize;
        let value = reader.take(value_len)?.to_vec();
        data.insert(key, value);
    }

    if reader.pos != body.len() {
        return Err(StorageError::Corrupted("trailing bytes after entries".into()));
    }

    Ok(data)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| StorageError::Corrupted("snapshot truncated".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> StorageResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
