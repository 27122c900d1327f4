use thiserror::Error;

use crate::engine::EngineError;
use crate::store::{StoreError, Version};

/// Why a switchover or failover request was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwitchoverRejection {
    #[error("candidate {0} is not a member of the cluster")]
    CandidateNotFound(String),
    #[error("leader name does not match: requested {requested}, current {current:?}")]
    LeaderMismatch {
        requested: String,
        current: Option<String>,
    },
    #[error("no eligible candidate to hand over to")]
    NoEligibleCandidate,
    #[error("none of the candidates is healthy")]
    NoHealthyMembers,
    #[error("there is no live leader")]
    NoLeader,
    #[error("failover needs a candidate")]
    CandidateRequired,
    #[error("a switchover is already in progress")]
    AlreadyInProgress,
}

#[derive(Error, Debug)]
pub enum HaError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("lost race on {key}: expected version {expected:?}, observed {observed:?}")]
    Conflict {
        key: String,
        expected: Option<Version>,
        observed: Option<Version>,
    },
    #[error("lost the lease on {key}, now held by {holder:?}")]
    LostLock { key: String, holder: Option<String> },
    #[error("lease on {key} is held by {holder}")]
    LeaseHeld { key: String, holder: String },
    #[error("precondition failed: {0}")]
    PreconditionFailed(#[from] SwitchoverRejection),
    #[error("engine command failed: {0}")]
    EngineCommandFailed(EngineError),
    #[error("engine connection not ready")]
    NotReady,
}

pub type HaResult<T> = std::result::Result<T, HaError>;

impl From<StoreError> for HaError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => HaError::Unavailable(msg),
            StoreError::Conflict {
                key,
                expected,
                observed,
            } => HaError::Conflict {
                key,
                expected,
                observed,
            },
        }
    }
}

impl From<EngineError> for HaError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotReady => HaError::NotReady,
            e => HaError::EngineCommandFailed(e),
        }
    }
}
