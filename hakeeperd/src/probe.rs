//! Asking other members how they are doing

use async_trait::async_trait;
use hakeeper_api::{Health, NodeRole, OpTime, OpsEvent, StatusResponse};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::cluster::Member;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerStatus {
    pub name: String,
    pub role: NodeRole,
    pub op_time: OpTime,
    pub is_healthy: bool,
}

impl From<StatusResponse> for PeerStatus {
    fn from(res: StatusResponse) -> Self {
        Self {
            name: res.name.to_string_lossy(),
            role: res.role,
            op_time: res.op_time,
            is_healthy: res.event == OpsEvent::Success && res.health == Health::Healthy,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("member {0} has no known address")]
    NoAddress(String),
    #[error("member {name} unreachable: {message}")]
    Unreachable { name: String, message: String },
}

#[async_trait]
pub trait PeerProbe: Send + Sync + 'static {
    async fn status(&self, member: &Member) -> Result<PeerStatus, ProbeError>;
}

/// Probes peers over their coordinator's rpc port
#[derive(Debug, Clone)]
pub struct RpcProbe {
    timeout: Duration,
}

impl RpcProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PeerProbe for RpcProbe {
    async fn status(&self, member: &Member) -> Result<PeerStatus, ProbeError> {
        if member.address.is_empty() {
            return Err(ProbeError::NoAddress(member.name.clone()));
        }
        let unreachable = |message: String| ProbeError::Unreachable {
            name: member.name.clone(),
            message,
        };
        let res = timeout(self.timeout, async {
            let mut client = hakeeper::Client::connect(member.address.as_str()).await?;
            client.check_status().await
        })
        .await
        .map_err(|_| unreachable(format!("no response within {:?}", self.timeout)))?
        .map_err(|e| unreachable(e.to_string()))?;
        Ok(res.into())
    }
}
