//! Database engine adapters
//!
//! The coordinator only ever talks to the engine through [`Engine`].
//! Engine-specific details (how to read the role, how to point
//! replication somewhere else) live in the adapters.

mod command;
mod sim;

use async_trait::async_trait;
use derive_more::Display;
use hakeeper_api::{EngineRole, OpTime};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use crate::cluster::Member;

pub use self::command::{CommandEngine, CommandSpec, Decoded, OutputShape};
pub use self::sim::SimEngine;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine connection not ready")]
    NotReady,
    #[error("engine {operation} failed: {message}")]
    CommandFailed {
        operation: Operation,
        message: String,
    },
    #[error("engine {operation} timed out after {timeout:?}")]
    Timeout {
        operation: Operation,
        timeout: Duration,
    },
    #[error("engine {operation} returned unexpected output: {output:?}")]
    Decode { operation: Operation, output: String },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Everything the coordinator needs from an engine
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Operation {
    #[display(fmt = "role")]
    Role,
    #[display(fmt = "op-time")]
    OpTime,
    #[display(fmt = "promote")]
    Promote,
    #[display(fmt = "demote")]
    Demote,
    #[display(fmt = "follow")]
    Follow,
    #[display(fmt = "replication-source")]
    ReplicationSource,
    #[display(fmt = "health-check")]
    HealthCheck,
    #[display(fmt = "sys-id")]
    SysId,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Role,
        Operation::OpTime,
        Operation::Promote,
        Operation::Demote,
        Operation::Follow,
        Operation::ReplicationSource,
        Operation::HealthCheck,
        Operation::SysId,
    ];
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.to_string() == s)
            .ok_or_else(|| format!("unknown engine operation: {s}"))
    }
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    async fn role(&self) -> EngineResult<EngineRole>;

    async fn op_time(&self) -> EngineResult<OpTime>;

    /// Make the engine accept writes
    async fn promote(&self) -> EngineResult<()>;

    /// Make the engine read-only
    async fn demote(&self) -> EngineResult<()>;

    /// Re-point replication at `leader`
    async fn follow(&self, leader: &Member) -> EngineResult<()>;

    /// Host the engine currently replicates from, if any
    async fn replication_source(&self) -> EngineResult<Option<String>>;

    async fn health_check(&self) -> EngineResult<()>;

    async fn sys_id(&self) -> EngineResult<String>;

    async fn is_running(&self) -> bool {
        self.health_check().await.is_ok()
    }
}

/// Does replication from `source` mean replicating from `leader`
///
/// Sources are often reported as fully qualified host names while
/// members are known by their short name, so only the first dot
/// separated label is compared.
pub fn source_matches(source: &str, leader: &Member) -> bool {
    fn first_label(s: &str) -> &str {
        s.split('.').next().unwrap_or(s)
    }
    fn is_ip(s: &str) -> bool {
        s.parse::<IpAddr>().is_ok()
    }

    let source = source.trim();
    if source.is_empty() {
        return false;
    }
    if source == leader.name || source == leader.host() {
        return true;
    }
    if is_ip(source) {
        return false;
    }
    let label = first_label(source);
    label == first_label(&leader.name)
        || (!is_ip(leader.host()) && label == first_label(leader.host()))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, clap::ValueEnum)]
pub enum EngineKind {
    #[value(name = "mysql")]
    MySql,
    Postgres,
    Redis,
    /// In-memory engine, for trying things out
    Sim,
}

impl EngineKind {
    pub fn default_port(self) -> u16 {
        match self {
            EngineKind::MySql => 3306,
            EngineKind::Postgres => 5432,
            EngineKind::Redis => 6379,
            EngineKind::Sim => 0,
        }
    }

    pub fn connector(self, config: EngineConfig) -> Arc<dyn Connector> {
        match self {
            EngineKind::Sim => Arc::new(sim::SimConnector),
            _ => Arc::new(command::CommandConnector::new(config)),
        }
    }
}

/// Doesn't show up in logs
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(pub String);

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(TypedBuilder, Debug, Clone)]
pub struct EngineConfig {
    pub kind: EngineKind,
    #[builder(default = String::from("root"))]
    pub user: String,
    #[builder(default)]
    pub password: Secret,
    /// Engine's own port, `kind`'s default if not set
    #[builder(default, setter(strip_option))]
    pub port: Option<u16>,
    #[builder(default = EngineConfig::DEFAULT_COMMAND_TIMEOUT)]
    pub command_timeout: Duration,
    /// Replace the built-in script for some operations
    #[builder(default)]
    pub overrides: BTreeMap<Operation, String>,
}

impl EngineConfig {
    pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }
}

/// Establishes the engine connection
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> EngineResult<Arc<dyn Engine>>;
}

/// Lazily connected engine
///
/// The connection is attempted in the background on first use, at most
/// one attempt at a time. Until it succeeds every caller gets `NotReady`
/// instead of blocking.
#[derive(Clone)]
pub struct EngineHandle {
    connector: Option<Arc<dyn Connector>>,
    slot: Arc<Mutex<Option<Arc<dyn Engine>>>>,
    is_connecting: Arc<AtomicBool>,
}

impl EngineHandle {
    pub fn lazy(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector: Some(connector),
            slot: Arc::new(Mutex::new(None)),
            is_connecting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Already connected
    pub fn ready(engine: Arc<dyn Engine>) -> Self {
        Self {
            connector: None,
            slot: Arc::new(Mutex::new(Some(engine))),
            is_connecting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Must be called from within a tokio runtime
    pub fn get(&self) -> EngineResult<Arc<dyn Engine>> {
        if let Some(engine) = self.slot.lock().expect("Locking failed").as_ref() {
            return Ok(engine.clone());
        }
        self.start_connecting();
        Err(EngineError::NotReady)
    }

    fn start_connecting(&self) {
        let Some(connector) = self.connector.clone() else {
            return;
        };
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let slot = self.slot.clone();
        let is_connecting = self.is_connecting.clone();
        tokio::spawn(async move {
            match connector.connect().await {
                Ok(engine) => {
                    *slot.lock().expect("Locking failed") = Some(engine);
                    info!("Engine connection established");
                }
                Err(e) => warn!(%e, "Engine connection failed, will retry"),
            }
            is_connecting.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_matching() {
        let leader = Member {
            name: "mysql-1".into(),
            address: "mysql-1.mysql-headless.default.svc:3501".into(),
            ..Member::default()
        };
        assert!(source_matches("mysql-1.mysql-headless", &leader));
        assert!(source_matches("mysql-1", &leader));
        assert!(!source_matches("mysql-10", &leader));
        assert!(!source_matches("", &leader));

        let by_ip = Member {
            name: "pg-0".into(),
            address: "10.1.2.3:3501".into(),
            ..Member::default()
        };
        assert!(source_matches("10.1.2.3", &by_ip));
        assert!(!source_matches("10.9.9.9", &by_ip));
    }

    #[test]
    fn operation_names() {
        for op in Operation::ALL {
            assert_eq!(op.to_string().parse::<Operation>(), Ok(op));
        }
        assert!("drop-database".parse::<Operation>().is_err());
    }

    #[tokio::test]
    async fn lazy_handle_connects_in_background() {
        let handle = EngineHandle::lazy(EngineKind::Sim.connector(
            EngineConfig::builder().kind(EngineKind::Sim).build(),
        ));
        assert!(matches!(handle.get(), Err(EngineError::NotReady)));

        let mut engine = None;
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if let Ok(e) = handle.get() {
                engine = Some(e);
                break;
            }
        }
        let engine = engine.expect("engine never connected");
        assert!(engine.is_running().await);
    }
}
