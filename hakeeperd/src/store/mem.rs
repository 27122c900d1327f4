use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{Entry, Store, StoreError, StoreResult, Version};
use crate::record::Annotations;

/// In-process store
///
/// Shared between coordinators living in one process, mostly in tests.
/// Can be switched off to simulate the store going away.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
    is_unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct MemStoreInner {
    entries: BTreeMap<String, (Annotations, Version)>,
    last_version: u64,
}

impl MemStoreInner {
    fn next_version(&mut self) -> Version {
        self.last_version += 1;
        Version(self.last_version)
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.is_unavailable.store(!available, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, MemStoreInner>> {
        if self.is_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store switched off".into()));
        }
        Ok(self.inner.lock().expect("Locking failed"))
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Entry>> {
        Ok(self
            .lock()?
            .entries
            .get(key)
            .map(|(annotations, version)| Entry {
                key: key.to_owned(),
                annotations: annotations.clone(),
                version: *version,
            }))
    }

    async fn create(&self, key: &str, annotations: Annotations) -> StoreResult<Version> {
        let mut inner = self.lock()?;
        if let Some((_, observed)) = inner.entries.get(key) {
            return Err(StoreError::Conflict {
                key: key.to_owned(),
                expected: None,
                observed: Some(*observed),
            });
        }
        let version = inner.next_version();
        inner.entries.insert(key.to_owned(), (annotations, version));
        Ok(version)
    }

    async fn update(
        &self,
        key: &str,
        annotations: Annotations,
        expected: Version,
    ) -> StoreResult<Version> {
        let mut inner = self.lock()?;
        let observed = inner.entries.get(key).map(|(_, v)| *v);
        if observed != Some(expected) {
            return Err(StoreError::Conflict {
                key: key.to_owned(),
                expected: Some(expected),
                observed,
            });
        }
        let version = inner.next_version();
        inner.entries.insert(key.to_owned(), (annotations, version));
        Ok(version)
    }

    async fn delete(&self, key: &str, expected: Option<Version>) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let Some(observed) = inner.entries.get(key).map(|(_, v)| *v) else {
            return Ok(());
        };
        if expected.map_or(false, |expected| expected != observed) {
            return Err(StoreError::Conflict {
                key: key.to_owned(),
                expected,
                observed: Some(observed),
            });
        }
        inner.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<Entry>> {
        Ok(self
            .lock()?
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (annotations, version))| Entry {
                key: key.clone(),
                annotations: annotations.clone(),
                version: *version,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(v: &str) -> Annotations {
        Annotations::from([("v".to_owned(), v.to_owned())])
    }

    #[tokio::test]
    async fn compare_and_swap() {
        let store = MemStore::new();

        let v1 = store.create("a", ann("1")).await.unwrap();
        assert!(matches!(
            store.create("a", ann("2")).await,
            Err(StoreError::Conflict { .. })
        ));

        let v2 = store.update("a", ann("2"), v1).await.unwrap();
        assert_ne!(v1, v2);
        assert!(matches!(
            store.update("a", ann("3"), v1).await,
            Err(StoreError::Conflict { observed: Some(o), .. }) if o == v2
        ));

        assert!(store.delete("a", Some(v1)).await.is_err());
        store.delete("a", Some(v2)).await.unwrap();
        store.delete("a", Some(v2)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_by_prefix() {
        let store = MemStore::new();
        for key in ["x.a-leader", "x.a-member-1", "x.b-leader", "y.a-leader"] {
            store.create(key, ann(key)).await.unwrap();
        }
        let keys: Vec<_> = store
            .list("x.a-")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, ["x.a-leader", "x.a-member-1"]);
    }

    #[tokio::test]
    async fn switched_off() {
        let store = MemStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("a").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert_eq!(store.get("a").await.unwrap(), None);
    }
}
