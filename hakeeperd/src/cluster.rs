//! Point-in-time view of the cluster, built from the store

use hakeeper_api::{NodeRole, OpTime};
use tracing::trace;

use crate::clock::UnixTime;
use crate::record::{
    self, Annotations, ClusterConfig, Keys, LeaderRecord, SwitchoverIntent, Versioned,
};
use crate::store::{Entry, Store, StoreResult};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    /// `host:port` the member's coordinator listens on, empty if unknown
    pub address: String,
    /// Port the member's database serves on; replicas connect here
    pub engine_port: Option<u16>,
    /// Role the member last advertised
    pub role: Option<NodeRole>,
    pub attributes: Annotations,
}

impl Member {
    pub fn from_annotations(name: &str, a: &Annotations) -> Self {
        Self {
            name: name.to_owned(),
            address: a.get(record::ADDRESS).cloned().unwrap_or_default(),
            engine_port: a.get(record::ENGINE_PORT).and_then(|p| p.trim().parse().ok()),
            role: a.get(record::ROLE).and_then(|r| NodeRole::from_hint(r)),
            attributes: a
                .iter()
                .filter(|(k, _)| {
                    ![record::ADDRESS, record::ENGINE_PORT, record::ROLE].contains(&k.as_str())
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn to_annotations(&self) -> Annotations {
        let mut a = self.attributes.clone();
        a.insert(record::ADDRESS.into(), self.address.clone());
        if let Some(port) = self.engine_port {
            a.insert(record::ENGINE_PORT.into(), port.to_string());
        }
        if let Some(role) = self.role {
            a.insert(record::ROLE.into(), role.as_hint().into());
        }
        a
    }

    /// A member we only know by name
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    pub fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _)| host)
    }

}

/// The holder of a live lease
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leader {
    pub member: Member,
    pub record: Versioned<LeaderRecord>,
}

impl Leader {
    pub fn name(&self) -> &str {
        &self.member.name
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cluster {
    pub sys_id: String,
    pub config: Option<ClusterConfig>,
    /// Set only if the lease is held and has not expired
    pub leader: Option<Leader>,
    /// Raw lease record, live or not
    pub leader_record: Option<Versioned<LeaderRecord>>,
    /// Leader's position as of its last renew
    pub op_time: OpTime,
    /// Sorted by name
    pub members: Vec<Member>,
    pub switchover: Option<Versioned<SwitchoverIntent>>,
    pub extra: Annotations,
}

impl Cluster {
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.member(name).is_some()
    }

    pub fn leader_name(&self) -> Option<&str> {
        self.leader.as_ref().map(Leader::name)
    }

    pub fn is_leader(&self, name: &str) -> bool {
        self.leader_name() == Some(name)
    }
}

/// When we first saw the current `(leader, renew_time)` pair
#[derive(Clone, Debug)]
struct ObservedLease {
    leader: String,
    renew_time: UnixTime,
    observed_at: UnixTime,
}

/// Builds [`Cluster`] snapshots for one process
///
/// Lease expiry is judged only against the local clock: a lease is live
/// until `ttl` seconds after this process last saw its renew time
/// change. The holder's own clock never matters, so skew between hosts
/// can't make a lease look expired early.
#[derive(Debug)]
pub struct SnapshotBuilder {
    keys: Keys,
    observed: Option<ObservedLease>,
}

impl SnapshotBuilder {
    pub fn new(keys: Keys) -> Self {
        Self {
            keys,
            observed: None,
        }
    }

    pub async fn refresh(&mut self, store: &dyn Store, now: UnixTime) -> StoreResult<Cluster> {
        let entries = store.list(self.keys.prefix()).await?;
        Ok(self.build(entries, now))
    }

    pub fn build(&mut self, entries: Vec<Entry>, now: UnixTime) -> Cluster {
        let leader_key = self.keys.leader();
        let config_key = self.keys.config();
        let switchover_key = self.keys.switchover();
        let extra_key = self.keys.extra();

        let mut cluster = Cluster::default();
        for entry in entries {
            if entry.key == leader_key {
                cluster.leader_record = Some(Versioned {
                    value: LeaderRecord::from_annotations(&entry.annotations),
                    version: entry.version,
                });
            } else if entry.key == config_key {
                cluster.config = Some(ClusterConfig::from_annotations(&entry.annotations));
            } else if entry.key == switchover_key {
                cluster.switchover = Some(Versioned {
                    value: SwitchoverIntent::from_annotations(&entry.annotations),
                    version: entry.version,
                });
            } else if entry.key == extra_key {
                cluster.extra = entry.annotations;
            } else if let Some(name) = self.keys.member_name(&entry.key) {
                cluster
                    .members
                    .push(Member::from_annotations(name, &entry.annotations));
            }
        }
        cluster.members.sort_by(|a, b| a.name.cmp(&b.name));
        cluster.sys_id = cluster
            .config
            .as_ref()
            .map(|c| c.sys_id.clone())
            .unwrap_or_default();

        let Some(record) = cluster.leader_record.clone() else {
            self.observed = None;
            return cluster;
        };
        cluster.op_time = record.value.op_time;

        let is_changed = self.observed.as_ref().map_or(true, |o| {
            o.leader != record.value.leader || o.renew_time != record.value.renew_time
        });
        if is_changed {
            self.observed = Some(ObservedLease {
                leader: record.value.leader.clone(),
                renew_time: record.value.renew_time,
                observed_at: now,
            });
        }
        let observed_at = self.observed.as_ref().map_or(now, |o| o.observed_at);

        let ttl = if 0 < record.value.ttl {
            record.value.ttl
        } else {
            cluster.config.as_ref().map_or(0, |c| c.ttl)
        };

        if record.value.is_released() {
            return cluster;
        }
        if observed_at.plus_secs(ttl) < now {
            trace!(
                leader = %record.value.leader,
                %observed_at,
                ttl,
                "Leader lease expired"
            );
            return cluster;
        }

        let member = cluster
            .member(&record.value.leader)
            .cloned()
            .unwrap_or_else(|| Member::unknown(&record.value.leader));
        cluster.leader = Some(Leader { member, record });
        cluster
    }
}
