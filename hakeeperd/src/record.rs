//! Shapes of the records kept in the coordination store
//!
//! Every record is a flat `String -> String` annotation map, so the
//! same layout works on any store that can hold labels. Parsing is
//! lenient: a missing or malformed field reads as its zero value.

use hakeeper_api::OpTime;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::clock::UnixTime;
use crate::store::Version;

pub type Annotations = BTreeMap<String, String>;

pub const LEADER: &str = "leader";
pub const ACQUIRE_TIME: &str = "acquire-time";
pub const RENEW_TIME: &str = "renew-time";
pub const TTL: &str = "ttl";
pub const OP_TIME: &str = "op-time";
pub const EXTRA: &str = "extra";
pub const SYS_ID: &str = "sys-id";
pub const MAX_LAG_ON_SWITCHOVER: &str = "max-lag-on-switchover";
pub const CANDIDATE: &str = "candidate";
pub const SCHEDULED_AT: &str = "scheduled-at";
pub const HANDED_OVER_AT: &str = "handed-over-at";
pub const ADDRESS: &str = "address";
pub const ROLE: &str = "role";
pub const ENGINE_PORT: &str = "engine-port";

fn parse_or_default<T: FromStr + Default>(a: &Annotations, key: &str) -> T {
    a.get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_default()
}

fn string_or_default(a: &Annotations, key: &str) -> String {
    a.get(key).cloned().unwrap_or_default()
}

/// A record value together with the store version it was read at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Names of all the keys a single cluster component uses
///
/// `<namespace>.<cluster>-<component>-{leader,config,switchover,extra,member-<name>}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    const MEMBER_INFIX: &'static str = "member-";

    pub fn new(namespace: &str, cluster: &str, component: &str) -> Self {
        Self {
            prefix: format!("{namespace}.{cluster}-{component}-"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn leader(&self) -> String {
        format!("{}leader", self.prefix)
    }

    pub fn config(&self) -> String {
        format!("{}config", self.prefix)
    }

    pub fn switchover(&self) -> String {
        format!("{}switchover", self.prefix)
    }

    pub fn extra(&self) -> String {
        format!("{}extra", self.prefix)
    }

    pub fn member(&self, name: &str) -> String {
        format!("{}{}{name}", self.prefix, Self::MEMBER_INFIX)
    }

    /// Member name if `key` is a member record key
    pub fn member_name<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(Self::MEMBER_INFIX)
            .filter(|name| !name.is_empty())
    }
}

/// The leader lease
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaderRecord {
    /// Holder's member name, empty when released
    pub leader: String,
    pub acquire_time: UnixTime,
    pub renew_time: UnixTime,
    /// Lease duration in seconds
    pub ttl: i64,
    /// Holder's replication position at last renew
    pub op_time: OpTime,
    pub extra: Annotations,
}

impl LeaderRecord {
    pub fn new(leader: &str, now: UnixTime, ttl: i64, op_time: OpTime) -> Self {
        Self {
            leader: leader.to_owned(),
            acquire_time: now,
            renew_time: now,
            ttl,
            op_time,
            extra: Annotations::new(),
        }
    }

    pub fn is_released(&self) -> bool {
        self.leader.is_empty()
    }

    pub fn from_annotations(a: &Annotations) -> Self {
        Self {
            leader: string_or_default(a, LEADER),
            acquire_time: UnixTime(parse_or_default(a, ACQUIRE_TIME)),
            renew_time: UnixTime(parse_or_default(a, RENEW_TIME)),
            ttl: parse_or_default(a, TTL),
            op_time: OpTime(parse_or_default(a, OP_TIME)),
            extra: a
                .get(EXTRA)
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_default(),
        }
    }

    pub fn to_annotations(&self) -> Annotations {
        let mut a = Annotations::new();
        a.insert(LEADER.into(), self.leader.clone());
        a.insert(ACQUIRE_TIME.into(), self.acquire_time.to_string());
        a.insert(RENEW_TIME.into(), self.renew_time.to_string());
        a.insert(TTL.into(), self.ttl.to_string());
        a.insert(OP_TIME.into(), self.op_time.to_string());
        if !self.extra.is_empty() {
            a.insert(
                EXTRA.into(),
                serde_json::to_string(&self.extra).expect("Can't fail"),
            );
        }
        a
    }
}

/// Cluster-wide configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    pub sys_id: String,
    pub ttl: i64,
    pub max_lag_on_switchover: i64,
}

impl ClusterConfig {
    pub fn from_annotations(a: &Annotations) -> Self {
        Self {
            sys_id: string_or_default(a, SYS_ID),
            ttl: parse_or_default(a, TTL),
            max_lag_on_switchover: parse_or_default(a, MAX_LAG_ON_SWITCHOVER),
        }
    }

    pub fn to_annotations(&self) -> Annotations {
        let mut a = Annotations::new();
        a.insert(SYS_ID.into(), self.sys_id.clone());
        a.insert(TTL.into(), self.ttl.to_string());
        a.insert(
            MAX_LAG_ON_SWITCHOVER.into(),
            self.max_lag_on_switchover.to_string(),
        );
        a
    }
}

/// Operator's request to move leadership
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwitchoverIntent {
    /// Leader expected to hand over, empty for "whoever it is"
    pub leader: String,
    /// Preferred successor, empty for "the healthiest"
    pub candidate: String,
    pub scheduled_at: UnixTime,
    /// Set by the leader once it has demoted itself for this intent
    pub handed_over_at: Option<UnixTime>,
}

impl SwitchoverIntent {
    pub fn is_handed_over(&self) -> bool {
        self.handed_over_at.is_some()
    }

    pub fn from_annotations(a: &Annotations) -> Self {
        Self {
            leader: string_or_default(a, LEADER),
            candidate: string_or_default(a, CANDIDATE),
            scheduled_at: UnixTime(parse_or_default(a, SCHEDULED_AT)),
            handed_over_at: a
                .get(HANDED_OVER_AT)
                .and_then(|v| v.trim().parse().ok())
                .map(UnixTime),
        }
    }

    pub fn to_annotations(&self) -> Annotations {
        let mut a = Annotations::new();
        a.insert(LEADER.into(), self.leader.clone());
        a.insert(CANDIDATE.into(), self.candidate.clone());
        a.insert(SCHEDULED_AT.into(), self.scheduled_at.to_string());
        if let Some(t) = self.handed_over_at {
            a.insert(HANDED_OVER_AT.into(), t.to_string());
        }
        a
    }
}

#[test]
fn malformed_fields_read_as_zero() {
    let mut a = Annotations::new();
    a.insert(LEADER.into(), "mysql-0".into());
    a.insert(RENEW_TIME.into(), "yesterday".into());
    a.insert(TTL.into(), " 30 ".into());
    a.insert(EXTRA.into(), "{not json".into());

    let record = LeaderRecord::from_annotations(&a);
    assert_eq!(record.leader, "mysql-0");
    assert_eq!(record.renew_time, UnixTime(0));
    assert_eq!(record.ttl, 30);
    assert_eq!(record.op_time, OpTime::zero());
    assert!(record.extra.is_empty());
}

#[test]
fn leader_record_keeps_extra() {
    let mut record = LeaderRecord::new("pg-1", UnixTime(10), 30, OpTime(7));
    record.extra.insert("timeline".into(), "3".into());

    let a = record.to_annotations();
    assert_eq!(LeaderRecord::from_annotations(&a), record);
}

#[test]
fn member_keys() {
    let keys = Keys::new("default", "orders", "mysql");
    assert_eq!(keys.leader(), "default.orders-mysql-leader");
    assert_eq!(
        keys.member_name(&keys.member("mysql-2")),
        Some("mysql-2")
    );
    assert_eq!(keys.member_name(&keys.switchover()), None);
    assert_eq!(keys.member_name("default.orders-mysql-member-"), None);
}
