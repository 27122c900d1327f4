//! Coordination store
//!
//! The only shared state between coordinators. Anything that can do
//! create-if-absent and compare-and-swap on a per-key version works.

mod file;
mod mem;

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::record::Annotations;

pub use self::file::FileStore;
pub use self::mem::MemStore;

/// Opaque, per-key version used for compare-and-swap
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Display, Serialize, Deserialize)]
pub struct Version(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub annotations: Annotations,
    pub version: Version,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("version conflict on {key}: expected {expected:?}, observed {observed:?}")]
    Conflict {
        key: String,
        expected: Option<Version>,
        observed: Option<Version>,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    fn unavailable(e: impl std::fmt::Display) -> Self {
        Self::Unavailable(e.to_string())
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<Entry>>;

    /// Create `key`, failing with `Conflict` if it already exists
    async fn create(&self, key: &str, annotations: Annotations) -> StoreResult<Version>;

    /// Replace `key` only if its version is still `expected`
    async fn update(
        &self,
        key: &str,
        annotations: Annotations,
        expected: Version,
    ) -> StoreResult<Version>;

    /// Delete `key`, version-checked when `expected` is set
    ///
    /// Deleting a key that is already gone succeeds.
    async fn delete(&self, key: &str, expected: Option<Version>) -> StoreResult<()>;

    /// All entries whose key starts with `prefix`, sorted by key
    async fn list(&self, prefix: &str) -> StoreResult<Vec<Entry>>;
}

/// Puts a deadline on every call of the wrapped store
///
/// A call that runs out of time is reported as `Unavailable`, same as
/// the store being down.
pub struct DeadlineStore {
    inner: Arc<dyn Store>,
    deadline: Duration,
}

impl DeadlineStore {
    pub fn new(inner: Arc<dyn Store>, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    async fn bounded<T>(&self, f: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match timeout(self.deadline, f).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Unavailable(format!(
                "no response within {:?}",
                self.deadline
            ))),
        }
    }
}

#[async_trait]
impl Store for DeadlineStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Entry>> {
        self.bounded(self.inner.get(key)).await
    }

    async fn create(&self, key: &str, annotations: Annotations) -> StoreResult<Version> {
        self.bounded(self.inner.create(key, annotations)).await
    }

    async fn update(
        &self,
        key: &str,
        annotations: Annotations,
        expected: Version,
    ) -> StoreResult<Version> {
        self.bounded(self.inner.update(key, annotations, expected))
            .await
    }

    async fn delete(&self, key: &str, expected: Option<Version>) -> StoreResult<()> {
        self.bounded(self.inner.delete(key, expected)).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<Entry>> {
        self.bounded(self.inner.list(prefix)).await
    }
}
