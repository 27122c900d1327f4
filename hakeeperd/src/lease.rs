//! The leader lease, on top of the store's compare-and-swap

use hakeeper_api::OpTime;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::cluster::Cluster;
use crate::error::{HaError, HaResult};
use crate::record::{Annotations, Keys, LeaderRecord};
use crate::store::{Store, StoreError, Version};

pub struct LeaseManager {
    store: Arc<dyn Store>,
    keys: Keys,
    clock: Arc<dyn Clock>,
    /// Used when the cluster config carries no ttl yet
    default_ttl: i64,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>, keys: Keys, clock: Arc<dyn Clock>, default_ttl: i64) -> Self {
        Self {
            store,
            keys,
            clock,
            default_ttl,
        }
    }

    fn ttl(&self, cluster: &Cluster) -> i64 {
        cluster
            .config
            .as_ref()
            .map(|c| c.ttl)
            .filter(|ttl| 0 < *ttl)
            .unwrap_or(self.default_ttl)
    }

    /// Try to take the lease as seen in `cluster`
    ///
    /// The write is conditioned on the record version in the snapshot,
    /// so of any number of racing callers exactly one succeeds; the
    /// rest get `Conflict`.
    pub async fn attempt_acquire(
        &self,
        cluster: &Cluster,
        name: &str,
        op_time: OpTime,
    ) -> HaResult<Version> {
        if let Some(leader) = cluster.leader.as_ref().filter(|l| l.name() != name) {
            return Err(HaError::LeaseHeld {
                key: self.keys.leader(),
                holder: leader.name().to_owned(),
            });
        }

        let now = self.clock.now();
        let mut record = LeaderRecord::new(name, now, self.ttl(cluster), op_time);
        let version = match cluster.leader_record.as_ref() {
            None => {
                self.store
                    .create(&self.keys.leader(), record.to_annotations())
                    .await?
            }
            Some(prev) => {
                if op_time.is_zero() {
                    record.op_time = prev.value.op_time;
                }
                self.store
                    .update(&self.keys.leader(), record.to_annotations(), prev.version)
                    .await?
            }
        };
        info!(leader = %name, %op_time, "Acquired leader lease");
        Ok(version)
    }

    /// Extend the lease we hold
    ///
    /// Reads the record fresh, so a lease taken over by someone else is
    /// reported as `LostLock` even if our last snapshot still showed us.
    /// A zero `op_time` or missing `extra` keeps the stored values.
    pub async fn renew(
        &self,
        name: &str,
        op_time: OpTime,
        extra: Option<Annotations>,
    ) -> HaResult<Version> {
        let key = self.keys.leader();
        let Some(entry) = self.store.get(&key).await? else {
            return Err(HaError::LostLock { key, holder: None });
        };
        let mut record = LeaderRecord::from_annotations(&entry.annotations);
        if record.leader != name {
            return Err(HaError::LostLock {
                key,
                holder: Some(record.leader).filter(|l| !l.is_empty()),
            });
        }

        record.renew_time = self.clock.now();
        if !op_time.is_zero() {
            record.op_time = op_time;
        }
        if let Some(extra) = extra {
            record.extra = extra;
        }

        match self
            .store
            .update(&key, record.to_annotations(), entry.version)
            .await
        {
            Ok(version) => {
                debug!(leader = %name, renew_time = %record.renew_time, "Renewed leader lease");
                Ok(version)
            }
            Err(StoreError::Conflict { .. }) => self.explain_conflict(name, entry.version).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Give up the lease, keeping the record and its op-time
    pub async fn release(&self, name: &str, op_time: OpTime) -> HaResult<()> {
        let key = self.keys.leader();
        let Some(entry) = self.store.get(&key).await? else {
            return Ok(());
        };
        let mut record = LeaderRecord::from_annotations(&entry.annotations);
        if record.leader != name {
            return Err(HaError::LostLock {
                key,
                holder: Some(record.leader).filter(|l| !l.is_empty()),
            });
        }
        record.leader.clear();
        if !op_time.is_zero() {
            record.op_time = op_time;
        }
        match self
            .store
            .update(&key, record.to_annotations(), entry.version)
            .await
        {
            Ok(_) => {
                info!(leader = %name, "Released leader lease");
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => {
                self.explain_conflict(name, entry.version).await.map(|_| ())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// After a failed CAS: `LostLock` if the holder changed, `Conflict` otherwise
    async fn explain_conflict(&self, name: &str, expected: Version) -> HaResult<Version> {
        let key = self.keys.leader();
        let current = self.store.get(&key).await?;
        let holder = current
            .as_ref()
            .map(|e| LeaderRecord::from_annotations(&e.annotations).leader);
        if holder.as_deref() != Some(name) {
            return Err(HaError::LostLock {
                key,
                holder: holder.filter(|l| !l.is_empty()),
            });
        }
        Err(HaError::Conflict {
            key,
            expected: Some(expected),
            observed: current.map(|e| e.version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, UnixTime};
    use crate::cluster::SnapshotBuilder;
    use crate::store::MemStore;

    struct Fixture {
        store: Arc<MemStore>,
        clock: Arc<ManualClock>,
        keys: Keys,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemStore::new()),
                clock: Arc::new(ManualClock::new(UnixTime(1000))),
                keys: Keys::new("ns", "c", "mysql"),
            }
        }

        fn lease(&self) -> LeaseManager {
            LeaseManager::new(self.store.clone(), self.keys.clone(), self.clock.clone(), 30)
        }

        async fn snapshot(&self) -> Cluster {
            SnapshotBuilder::new(self.keys.clone())
                .refresh(&*self.store, self.clock.now())
                .await
                .unwrap()
        }

        async fn record(&self) -> LeaderRecord {
            let entry = self.store.get(&self.keys.leader()).await.unwrap().unwrap();
            LeaderRecord::from_annotations(&entry.annotations)
        }
    }

    #[tokio::test]
    async fn only_one_of_racing_acquirers_wins() {
        let f = Fixture::new();
        let (a, b) = (f.lease(), f.lease());
        let snapshot = f.snapshot().await;

        a.attempt_acquire(&snapshot, "a", OpTime(10)).await.unwrap();
        assert!(matches!(
            b.attempt_acquire(&snapshot, "b", OpTime(10)).await,
            Err(HaError::Conflict { .. })
        ));
        assert_eq!(f.record().await.leader, "a");

        // with a fresh view `b` sees the live lease and doesn't even try
        assert!(matches!(
            b.attempt_acquire(&f.snapshot().await, "b", OpTime(10)).await,
            Err(HaError::LeaseHeld { holder, .. }) if holder == "a"
        ));
    }

    #[tokio::test]
    async fn renew_and_release() {
        let f = Fixture::new();
        let lease = f.lease();
        lease
            .attempt_acquire(&f.snapshot().await, "a", OpTime(10))
            .await
            .unwrap();

        f.clock.advance(5);
        lease.renew("a", OpTime::zero(), None).await.unwrap();
        let record = f.record().await;
        assert_eq!(record.renew_time, UnixTime(1005));
        assert_eq!(record.acquire_time, UnixTime(1000));
        assert_eq!(record.op_time, OpTime(10));

        lease.release("a", OpTime(12)).await.unwrap();
        let record = f.record().await;
        assert!(record.is_released());
        assert_eq!(record.op_time, OpTime(12));

        // released record gets taken over in place
        let snapshot = f.snapshot().await;
        assert!(snapshot.leader.is_none());
        lease.attempt_acquire(&snapshot, "b", OpTime::zero()).await.unwrap();
        let record = f.record().await;
        assert_eq!(record.leader, "b");
        assert_eq!(record.op_time, OpTime(12));
    }

    #[tokio::test]
    async fn renew_by_non_holder_is_lost_lock() {
        let f = Fixture::new();
        f.lease()
            .attempt_acquire(&f.snapshot().await, "a", OpTime(1))
            .await
            .unwrap();

        assert!(matches!(
            f.lease().renew("b", OpTime(1), None).await,
            Err(HaError::LostLock { holder: Some(h), .. }) if h == "a"
        ));
        assert!(matches!(
            f.lease().release("b", OpTime(1)).await,
            Err(HaError::LostLock { .. })
        ));
        assert_eq!(f.record().await.leader, "a");
    }

    #[tokio::test]
    async fn store_outage_is_unavailable() {
        let f = Fixture::new();
        f.store.set_available(false);
        assert!(matches!(
            f.lease().renew("a", OpTime(1), None).await,
            Err(HaError::Unavailable(_))
        ));
    }
}
