use async_trait::async_trait;
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Entry, Store, StoreError, StoreResult, Version};
use crate::record::Annotations;

const LOCK_FILE_NAME: &str = ".lock";
const SEQ_FILE_NAME: &str = ".seq";
const RECORD_EXT: &str = "rec";

/// Store kept in a directory, one file per key
///
/// Every operation holds an exclusive `flock` on the directory lock
/// file, so any number of coordinator processes on hosts sharing the
/// directory get linearizable compare-and-swap.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: Arc<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    version: Version,
    annotations: Annotations,
}

impl FileStore {
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        debug!(dir = %dir.display(), "Opened file store");
        Ok(Self {
            dir: Arc::new(dir.to_owned()),
        })
    }

    /// Run `f` with the directory locked, off the async executor
    async fn locked<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Path) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let lock_file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(dir.join(LOCK_FILE_NAME))
                .map_err(StoreError::unavailable)?;
            flock(lock_file.as_raw_fd(), FlockArg::LockExclusive)
                .map_err(StoreError::unavailable)?;
            // released when `lock_file` gets closed
            f(&dir)
        })
        .await
        .map_err(StoreError::unavailable)?
    }
}

fn record_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.{RECORD_EXT}", escape_key(key)))
}

/// Keys are mostly `[a-zA-Z0-9._-]`; anything else gets `%xx`-escaped
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(char::from(b))
            }
            _ => out.push_str(&format!("%{b:02x}")),
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut iter = name.bytes();
    while let Some(b) = iter.next() {
        if b == b'%' {
            let hex = [iter.next()?, iter.next()?];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}

fn read_entry(path: &Path) -> StoreResult<Option<StoredEntry>> {
    let mut buf = vec![];
    match File::open(path) {
        Ok(mut file) => file
            .read_to_end(&mut buf)
            .map_err(StoreError::unavailable)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::unavailable(e)),
    };
    rmp_serde::from_slice(&buf)
        .map(Some)
        .map_err(|e| StoreError::Unavailable(format!("corrupted {}: {e}", path.display())))
}

/// Write via a temporary file and rename, so readers never see half a record
fn write_entry(path: &Path, entry: &StoredEntry) -> StoreResult<()> {
    let buf = rmp_serde::to_vec(entry).map_err(StoreError::unavailable)?;
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, buf: &[u8]) -> StoreResult<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path).map_err(StoreError::unavailable)?;
    file.write_all(buf).map_err(StoreError::unavailable)?;
    file.sync_data().map_err(StoreError::unavailable)?;
    fs::rename(&tmp_path, path).map_err(StoreError::unavailable)
}

/// Highest version held by any record in `dir`
fn max_record_version(dir: &Path) -> StoreResult<u64> {
    let mut max = 0;
    for dir_entry in fs::read_dir(dir).map_err(StoreError::unavailable)? {
        let path = dir_entry.map_err(StoreError::unavailable)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
            continue;
        }
        if let Some(stored) = read_entry(&path)? {
            max = max.max(stored.version.0);
        }
    }
    Ok(max)
}

/// Bump the directory-wide version counter
///
/// A lost or garbled counter is rebuilt from the records, never from 0,
/// so a version once handed out for a live record is not handed out again.
fn next_version(dir: &Path) -> StoreResult<Version> {
    let path = dir.join(SEQ_FILE_NAME);
    let counter = match fs::read_to_string(&path) {
        Ok(s) => s.trim().parse::<u64>().ok(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(StoreError::unavailable(e)),
    };
    let from_records = max_record_version(dir)?;
    let last = match counter {
        Some(last) => last.max(from_records),
        None => {
            if 0 < from_records {
                warn!(
                    path = %path.display(),
                    from_records,
                    "Version counter missing or malformed, recovered from records"
                );
            }
            from_records
        }
    };
    let next = last + 1;
    write_atomic(&path, next.to_string().as_bytes())?;
    Ok(Version(next))
}

fn conflict(key: &str, expected: Option<Version>, observed: Option<Version>) -> StoreError {
    StoreError::Conflict {
        key: key.to_owned(),
        expected,
        observed,
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Entry>> {
        let key = key.to_owned();
        self.locked(move |dir| {
            Ok(read_entry(&record_path(dir, &key))?.map(|stored| Entry {
                key,
                annotations: stored.annotations,
                version: stored.version,
            }))
        })
        .await
    }

    async fn create(&self, key: &str, annotations: Annotations) -> StoreResult<Version> {
        let key = key.to_owned();
        self.locked(move |dir| {
            let path = record_path(dir, &key);
            if let Some(existing) = read_entry(&path)? {
                return Err(conflict(&key, None, Some(existing.version)));
            }
            let version = next_version(dir)?;
            write_entry(
                &path,
                &StoredEntry {
                    version,
                    annotations,
                },
            )?;
            Ok(version)
        })
        .await
    }

    async fn update(
        &self,
        key: &str,
        annotations: Annotations,
        expected: Version,
    ) -> StoreResult<Version> {
        let key = key.to_owned();
        self.locked(move |dir| {
            let path = record_path(dir, &key);
            let observed = read_entry(&path)?.map(|e| e.version);
            if observed != Some(expected) {
                return Err(conflict(&key, Some(expected), observed));
            }
            let version = next_version(dir)?;
            write_entry(
                &path,
                &StoredEntry {
                    version,
                    annotations,
                },
            )?;
            Ok(version)
        })
        .await
    }

    async fn delete(&self, key: &str, expected: Option<Version>) -> StoreResult<()> {
        let key = key.to_owned();
        self.locked(move |dir| {
            let path = record_path(dir, &key);
            let Some(existing) = read_entry(&path)? else {
                return Ok(());
            };
            if expected.map_or(false, |expected| expected != existing.version) {
                return Err(conflict(&key, expected, Some(existing.version)));
            }
            fs::remove_file(&path).map_err(StoreError::unavailable)
        })
        .await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<Entry>> {
        let prefix = prefix.to_owned();
        self.locked(move |dir| {
            let mut entries = vec![];
            for dir_entry in fs::read_dir(dir).map_err(StoreError::unavailable)? {
                let path = dir_entry.map_err(StoreError::unavailable)?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                    continue;
                }
                let Some(key) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(unescape_key)
                else {
                    continue;
                };
                if !key.starts_with(&prefix) {
                    continue;
                }
                if let Some(stored) = read_entry(&path)? {
                    entries.push(Entry {
                        key,
                        annotations: stored.annotations,
                        version: stored.version,
                    });
                }
            }
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(entries)
        })
        .await
    }
}
