use async_trait::async_trait;
use hakeeper_api::{EngineRole, OpTime};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use super::{Connector, Engine, EngineError, EngineResult, Operation};
use crate::cluster::Member;

/// In-memory engine
///
/// Keeps just enough state to act like a replicated database: a role,
/// a position and a replication source. Individual operations can be
/// made to fail.
#[derive(Debug)]
pub struct SimEngine {
    state: Mutex<SimState>,
}

#[derive(Debug)]
struct SimState {
    role: EngineRole,
    op_time: OpTime,
    source: Option<String>,
    sys_id: String,
    failing: BTreeSet<Operation>,
}

impl SimEngine {
    pub fn new(role: EngineRole) -> Self {
        Self {
            state: Mutex::new(SimState {
                role,
                op_time: OpTime::zero(),
                source: None,
                sys_id: "sim".into(),
                failing: BTreeSet::new(),
            }),
        }
    }

    pub fn secondary() -> Self {
        Self::new(EngineRole::Secondary)
    }

    fn with<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        f(&mut self.state.lock().expect("Locking failed"))
    }

    fn check(&self, op: Operation) -> EngineResult<()> {
        if self.with(|s| s.failing.contains(&op)) {
            return Err(EngineError::CommandFailed {
                operation: op,
                message: "simulated failure".into(),
            });
        }
        Ok(())
    }

    pub fn set_op_time(&self, op_time: OpTime) {
        self.with(|s| s.op_time = op_time);
    }

    /// Make `op` fail (or succeed again) from now on
    pub fn set_failing(&self, op: Operation, is_failing: bool) {
        self.with(|s| {
            if is_failing {
                s.failing.insert(op);
            } else {
                s.failing.remove(&op);
            }
        });
    }

    pub fn set_source(&self, source: Option<&str>) {
        self.with(|s| s.source = source.map(str::to_owned));
    }

    pub fn current_role(&self) -> EngineRole {
        self.with(|s| s.role)
    }

    pub fn current_source(&self) -> Option<String> {
        self.with(|s| s.source.clone())
    }
}

#[async_trait]
impl Engine for SimEngine {
    async fn role(&self) -> EngineResult<EngineRole> {
        self.check(Operation::Role)?;
        Ok(self.current_role())
    }

    async fn op_time(&self) -> EngineResult<OpTime> {
        self.check(Operation::OpTime)?;
        Ok(self.with(|s| s.op_time))
    }

    async fn promote(&self) -> EngineResult<()> {
        self.check(Operation::Promote)?;
        self.with(|s| {
            s.role = EngineRole::Primary;
            s.source = None;
        });
        Ok(())
    }

    async fn demote(&self) -> EngineResult<()> {
        self.check(Operation::Demote)?;
        self.with(|s| s.role = EngineRole::Secondary);
        Ok(())
    }

    async fn follow(&self, leader: &Member) -> EngineResult<()> {
        self.check(Operation::Follow)?;
        self.with(|s| s.source = Some(leader.name.clone()));
        Ok(())
    }

    async fn replication_source(&self) -> EngineResult<Option<String>> {
        self.check(Operation::ReplicationSource)?;
        Ok(self.current_source())
    }

    async fn health_check(&self) -> EngineResult<()> {
        self.check(Operation::HealthCheck)
    }

    async fn sys_id(&self) -> EngineResult<String> {
        self.check(Operation::SysId)?;
        Ok(self.with(|s| s.sys_id.clone()))
    }
}

pub(super) struct SimConnector;

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self) -> EngineResult<Arc<dyn Engine>> {
        Ok(Arc::new(SimEngine::secondary()))
    }
}
