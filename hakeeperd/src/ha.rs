//! Per-node HA logic
//!
//! Every poll the node reads the whole cluster view from the store,
//! checks its engine, and then acts on one of three situations: it
//! holds the lease, someone else holds it, or nobody does. The lease
//! CAS in the store is the only thing that decides who is leader;
//! everything else here is about deciding who should try.

use futures::future::join_all;
use hakeeper_api::{
    EngineRole, Health, NodeRole, OpTime, OpsEvent, OpsResponse, StatusResponse,
};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::clock::{Clock, UnixTime};
use crate::cluster::{Cluster, Leader, Member, SnapshotBuilder};
use crate::engine::{source_matches, EngineHandle};
use crate::error::{HaError, HaResult, SwitchoverRejection};
use crate::health::{self, HealthEvent, HealthMonitor};
use crate::lease::LeaseManager;
use crate::probe::{PeerProbe, PeerStatus};
use crate::record::{Annotations, ClusterConfig, Keys, SwitchoverIntent, Versioned};
use crate::store::{DeadlineStore, Store, StoreError, Version};
use crate::Parameters;

/// Outside world the node talks to
pub struct Backends {
    pub store: Arc<dyn Store>,
    pub engine: EngineHandle,
    pub probe: Arc<dyn PeerProbe>,
    pub clock: Arc<dyn Clock>,
}

/// What a poll cycle ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Still the leader
    Renewed,
    /// Took the lease and promoted the engine
    Acquired,
    /// Demoted and released the lease for a switchover
    HandedOver,
    /// Released the lease because the engine is degraded
    SteppedDown,
    /// Re-pointed replication at the leader
    Followed,
    /// Already replicating from the leader
    Following,
    /// No leader, but this node should not be the one taking over
    Declined,
    /// Handed over, successor not visible yet
    AwaitingSuccessor,
    /// Handed over, but nobody took over in time
    AbandonedHandover,
}

/// Outcome of an operator request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsResult {
    pub event: OpsEvent,
    pub message: String,
}

impl OpsResult {
    pub fn is_success(&self) -> bool {
        self.event == OpsEvent::Success
    }

    fn from_res(res: HaResult<String>) -> Self {
        match res {
            Ok(message) => Self {
                event: OpsEvent::Success,
                message,
            },
            Err(e) => Self {
                event: OpsEvent::Failed,
                message: e.to_string(),
            },
        }
    }
}

impl From<OpsResult> for OpsResponse {
    fn from(res: OpsResult) -> Self {
        Self {
            event: res.event,
            message: res.message.as_str().into(),
        }
    }
}

/// Published after every cycle
#[derive(Debug, Clone, Default)]
pub struct NodeStatus {
    pub name: String,
    pub role: NodeRole,
    pub cluster: Arc<Cluster>,
    pub op_time: OpTime,
    pub lag: i64,
    pub is_degraded: bool,
    /// When the engine last turned degraded, `None` while healthy
    pub degraded_since: Option<UnixTime>,
}

impl NodeStatus {
    pub fn leader_name(&self) -> Option<&str> {
        self.cluster.leader_name()
    }
}

impl From<&NodeStatus> for StatusResponse {
    fn from(status: &NodeStatus) -> Self {
        Self {
            event: OpsEvent::Success,
            name: status.name.as_str().into(),
            role: status.role,
            leader: status.leader_name().into(),
            op_time: status.op_time,
            lag: status.lag,
            health: if status.is_degraded {
                Health::Degraded
            } else {
                Health::Healthy
            },
            message: "".into(),
        }
    }
}

impl From<&NodeStatus> for PeerStatus {
    fn from(status: &NodeStatus) -> Self {
        Self {
            name: status.name.clone(),
            role: status.role,
            op_time: status.op_time,
            is_healthy: !status.is_degraded,
        }
    }
}

/// We gave up leadership and are waiting for someone else to take it
#[derive(Debug, Clone)]
struct Handover {
    /// Version of the intent we stamped, `None` for an explicit demote
    intent_version: Option<Version>,
    started_at: UnixTime,
}

struct HaState {
    snapshot: SnapshotBuilder,
    cluster: Arc<Cluster>,
    role: NodeRole,
    health: HealthMonitor,
    degraded_since: Option<UnixTime>,
    op_time: OpTime,
    last_renewed: Option<UnixTime>,
    handover: Option<Handover>,
    registered_role: Option<NodeRole>,
}

pub struct Ha {
    params: Parameters,
    address: String,
    keys: Keys,
    store: Arc<dyn Store>,
    engine: EngineHandle,
    probe: Arc<dyn PeerProbe>,
    clock: Arc<dyn Clock>,
    lease: LeaseManager,
    state: Mutex<HaState>,
    status_tx: watch::Sender<Arc<NodeStatus>>,
    status_rx: watch::Receiver<Arc<NodeStatus>>,
}

impl Ha {
    pub fn new(params: Parameters, address: String, backends: Backends) -> Self {
        let keys = params.keys();
        let store: Arc<dyn Store> =
            Arc::new(DeadlineStore::new(backends.store, params.store_timeout));
        let lease = LeaseManager::new(
            store.clone(),
            keys.clone(),
            backends.clock.clone(),
            params.ttl_secs,
        );
        let (status_tx, status_rx) = watch::channel(Arc::new(NodeStatus {
            name: params.name.clone(),
            ..NodeStatus::default()
        }));
        Self {
            state: Mutex::new(HaState {
                snapshot: SnapshotBuilder::new(keys.clone()),
                cluster: Arc::default(),
                role: NodeRole::Follower,
                health: HealthMonitor::new(params.failure_threshold),
                degraded_since: None,
                op_time: OpTime::zero(),
                last_renewed: None,
                handover: None,
                registered_role: None,
            }),
            params,
            address,
            keys,
            store,
            engine: backends.engine,
            probe: backends.probe,
            clock: backends.clock,
            lease,
            status_tx,
            status_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Status as of the last cycle
    pub fn status(&self) -> Arc<NodeStatus> {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<NodeStatus>> {
        self.status_rx.clone()
    }

    /// One poll cycle
    pub async fn run_cycle(&self) -> HaResult<Action> {
        let mut state = self.state.lock().await;
        let res = self.run_cycle_locked(&mut state).await;
        if let Err(e) = self.register(&mut state).await {
            debug!(%e, "Could not update member record");
        }
        self.publish(&state);
        res
    }

    async fn run_cycle_locked(&self, state: &mut HaState) -> HaResult<Action> {
        self.check_health(state).await;

        let cluster = match self.refresh(state).await {
            Ok(cluster) => cluster,
            Err(e) => {
                self.check_own_lease(state).await;
                return Err(e);
            }
        };
        self.ensure_config(&cluster).await?;

        match cluster.leader.as_ref() {
            Some(leader) if leader.name() == self.name() => {
                self.act_as_leader(state, &cluster).await
            }
            Some(leader) => self.act_as_follower(state, &cluster, leader).await,
            None => self.act_without_leader(state, &cluster).await,
        }
    }

    async fn check_health(&self, state: &mut HaState) {
        let res = match self.engine.get() {
            Ok(engine) => match engine.health_check().await {
                Ok(()) => engine.op_time().await.map(|op_time| state.op_time = op_time),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let now = self.clock.now();
        match state.health.record(&res) {
            Some(HealthEvent::Degraded { .. }) => state.degraded_since = Some(now),
            Some(HealthEvent::Recovered) => {
                if let Some(since) = state.degraded_since.take() {
                    info!(degraded_secs = now.0 - since.0, "Member healthy again");
                }
            }
            None => {}
        }
    }

    async fn refresh(&self, state: &mut HaState) -> HaResult<Arc<Cluster>> {
        let cluster = state
            .snapshot
            .refresh(&*self.store, self.clock.now())
            .await?;
        state.cluster = Arc::new(cluster);
        Ok(state.cluster.clone())
    }

    async fn ensure_config(&self, cluster: &Cluster) -> HaResult<()> {
        if cluster.config.is_some() {
            return Ok(());
        }
        let sys_id = match self.engine.get() {
            Ok(engine) => engine.sys_id().await.unwrap_or_default(),
            Err(_) => String::new(),
        };
        let config = ClusterConfig {
            sys_id,
            ttl: self.params.ttl_secs,
            max_lag_on_switchover: self.params.max_lag_on_switchover,
        };
        match self
            .store
            .create(&self.keys.config(), config.to_annotations())
            .await
        {
            Ok(_) => {
                info!(
                    ttl = config.ttl,
                    max_lag = config.max_lag_on_switchover,
                    "Initialized cluster config"
                );
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn register(&self, state: &mut HaState) -> HaResult<()> {
        let role = state.role;
        if state.registered_role == Some(role) && state.cluster.has_member(self.name()) {
            return Ok(());
        }
        let member = Member {
            name: self.name().to_owned(),
            address: self.address.clone(),
            engine_port: self.params.engine_port,
            role: Some(role),
            attributes: Annotations::new(),
        };
        let key = self.keys.member(self.name());
        match self.store.get(&key).await? {
            None => {
                self.store.create(&key, member.to_annotations()).await?;
            }
            Some(entry) => {
                self.store
                    .update(&key, member.to_annotations(), entry.version)
                    .await?;
            }
        }
        state.registered_role = Some(role);
        Ok(())
    }

    fn publish(&self, state: &HaState) {
        let lag = if state.role == NodeRole::Leader {
            0
        } else {
            health::lag(state.cluster.op_time, state.op_time).max(0)
        };
        // we hold a receiver ourselves, so this can't fail
        let _ = self.status_tx.send(Arc::new(NodeStatus {
            name: self.name().to_owned(),
            role: state.role,
            cluster: state.cluster.clone(),
            op_time: state.op_time,
            lag,
            is_degraded: state.health.is_degraded(),
            degraded_since: state.degraded_since,
        }));
    }

    fn ttl(&self, cluster: &Cluster) -> i64 {
        cluster
            .config
            .as_ref()
            .map(|c| c.ttl)
            .filter(|ttl| 0 < *ttl)
            .unwrap_or(self.params.ttl_secs)
    }

    fn max_lag(&self, cluster: &Cluster) -> i64 {
        cluster
            .config
            .as_ref()
            .map_or(self.params.max_lag_on_switchover, |c| {
                c.max_lag_on_switchover
            })
    }

    fn is_handover_timed_out(&self, handover: &Handover, now: UnixTime) -> bool {
        handover.started_at.plus_secs(self.params.handover_timeout_secs) < now
    }

    fn is_intent_expired(&self, intent: &SwitchoverIntent, now: UnixTime) -> bool {
        intent
            .handed_over_at
            .unwrap_or(intent.scheduled_at)
            .plus_secs(self.params.handover_timeout_secs)
            < now
    }

    /// Best effort: make sure a leader that can't reach the store stops
    /// being primary once its lease must have run out for everyone else
    async fn check_own_lease(&self, state: &mut HaState) {
        if state.role != NodeRole::Leader {
            return;
        }
        let ttl = self.ttl(&state.cluster);
        let now = self.clock.now();
        if state
            .last_renewed
            .map_or(true, |t| t.plus_secs(ttl) < now)
        {
            warn!("Could not renew the lease in time, demoting");
            self.demote_engine().await;
            state.role = NodeRole::Follower;
        }
    }

    async fn demote_engine(&self) {
        match self.engine.get() {
            Ok(engine) => {
                if let Err(e) = engine.demote().await {
                    error!(%e, "Failed to demote engine");
                }
            }
            Err(e) => warn!(%e, "Can't demote engine"),
        }
    }

    /// Release the lease if we hold it
    async fn release_lease(&self, op_time: OpTime) -> HaResult<()> {
        match self.lease.release(self.name(), op_time).await {
            Ok(()) | Err(HaError::LostLock { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_intent(&self, intent: &Versioned<SwitchoverIntent>) -> HaResult<()> {
        match self
            .store
            .delete(&self.keys.switchover(), Some(intent.version))
            .await
        {
            // someone replaced it in the meantime; theirs to deal with
            Ok(()) | Err(StoreError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn probe_members(&self, members: &[&Member]) -> Vec<PeerStatus> {
        join_all(members.iter().map(|m| self.probe.status(m)))
            .await
            .into_iter()
            .filter_map(|res| match res {
                Ok(status) => Some(status),
                Err(e) => {
                    debug!(%e, "Peer probe failed");
                    None
                }
            })
            .collect()
    }

    async fn act_as_leader(&self, state: &mut HaState, cluster: &Cluster) -> HaResult<Action> {
        if state.health.is_degraded() {
            return self.step_down(state).await;
        }

        match self.lease.renew(self.name(), state.op_time, None).await {
            Ok(_) => state.last_renewed = Some(self.clock.now()),
            Err(e @ HaError::LostLock { .. }) => {
                warn!(%e, "Lost the lease, stepping down");
                state.role = NodeRole::Follower;
                self.demote_engine().await;
                return Err(e);
            }
            Err(e) => {
                self.check_own_lease(state).await;
                return Err(e);
            }
        }

        if let Some(intent) = cluster.switchover.as_ref() {
            if let Some(action) = self.process_intent_as_leader(state, cluster, intent).await? {
                return Ok(action);
            }
        }

        self.enforce_primary(state).await?;
        Ok(Action::Renewed)
    }

    async fn step_down(&self, state: &mut HaState) -> HaResult<Action> {
        warn!(
            failures = state.health.failures(),
            "Engine degraded, giving up leadership"
        );
        self.demote_engine().await;
        self.release_lease(state.op_time).await?;
        state.role = NodeRole::Follower;
        Ok(Action::SteppedDown)
    }

    /// Make sure the engine of the lease holder is actually primary
    async fn enforce_primary(&self, state: &mut HaState) -> HaResult<()> {
        let engine = self.engine.get()?;
        if engine.role().await? != EngineRole::Primary {
            info!("Holding the lease but engine is not primary, promoting");
            engine.promote().await?;
        }
        state.role = NodeRole::Leader;
        Ok(())
    }

    /// `Some` if the intent took over this cycle
    async fn process_intent_as_leader(
        &self,
        state: &mut HaState,
        cluster: &Cluster,
        intent: &Versioned<SwitchoverIntent>,
    ) -> HaResult<Option<Action>> {
        let now = self.clock.now();
        let value = &intent.value;

        if value.candidate == self.name() {
            info!("Switchover to this member completed");
            self.delete_intent(intent).await?;
            state.handover = None;
            return Ok(None);
        }

        if value.is_handed_over() && value.leader == self.name() {
            let is_pending = state
                .handover
                .as_ref()
                .map_or(false, |h| !self.is_handover_timed_out(h, now));
            if is_pending {
                // demote or release failed last time
                return self.hand_over(state).await.map(Some);
            }
            warn!("Switchover did not complete in time, staying leader");
            self.delete_intent(intent).await?;
            state.handover = None;
            return Ok(None);
        }

        if value.is_handed_over() {
            debug!(previous = %value.leader, "Cleaning up a finished switchover");
            self.delete_intent(intent).await?;
            return Ok(None);
        }

        if self.is_intent_expired(value, now) {
            warn!(scheduled_at = %value.scheduled_at, "Dropping expired switchover request");
            self.delete_intent(intent).await?;
            return Ok(None);
        }

        if let Err(reason) = self
            .validate_switchover(cluster, value, state.op_time)
            .await
        {
            warn!(
                %reason,
                leader = %value.leader,
                candidate = %value.candidate,
                "Rejecting switchover"
            );
            self.delete_intent(intent).await?;
            return Err(reason.into());
        }

        info!(candidate = %value.candidate, "Handing over leadership");
        let stamped = SwitchoverIntent {
            leader: self.name().to_owned(),
            handed_over_at: Some(now),
            ..value.clone()
        };
        let version = self
            .store
            .update(
                &self.keys.switchover(),
                stamped.to_annotations(),
                intent.version,
            )
            .await?;
        state.handover = Some(Handover {
            intent_version: Some(version),
            started_at: now,
        });
        self.hand_over(state).await.map(Some)
    }

    /// Some candidate must be healthy and close enough to `op_time` to
    /// take over, or the handover would leave the cluster leaderless
    async fn validate_switchover(
        &self,
        cluster: &Cluster,
        intent: &SwitchoverIntent,
        op_time: OpTime,
    ) -> Result<(), SwitchoverRejection> {
        if !intent.leader.is_empty() && intent.leader != self.name() {
            return Err(SwitchoverRejection::LeaderMismatch {
                requested: intent.leader.clone(),
                current: Some(self.name().to_owned()),
            });
        }

        let candidates: Vec<&Member> = if intent.candidate.is_empty() {
            cluster
                .members
                .iter()
                .filter(|m| m.name != self.name())
                .collect()
        } else {
            let candidate = cluster
                .member(&intent.candidate)
                .ok_or_else(|| SwitchoverRejection::CandidateNotFound(intent.candidate.clone()))?;
            vec![candidate]
        };
        if candidates.is_empty() {
            return Err(SwitchoverRejection::NoEligibleCandidate);
        }

        let healthy: Vec<PeerStatus> = self
            .probe_members(&candidates)
            .await
            .into_iter()
            .filter(|s| s.is_healthy)
            .collect();
        if healthy.is_empty() {
            return Err(SwitchoverRejection::NoHealthyMembers);
        }

        let max_lag = self.max_lag(cluster);
        if healthy
            .iter()
            .all(|s| health::is_lagging(health::lag(op_time, s.op_time), max_lag))
        {
            debug!(%op_time, max_lag, "All healthy candidates lag behind");
            return Err(SwitchoverRejection::NoEligibleCandidate);
        }
        Ok(())
    }

    async fn hand_over(&self, state: &mut HaState) -> HaResult<Action> {
        let engine = self.engine.get()?;
        engine.demote().await?;
        let op_time = engine.op_time().await.unwrap_or(state.op_time);
        self.release_lease(op_time).await?;
        state.role = NodeRole::Follower;
        info!("Handed over, waiting for a successor");
        Ok(Action::HandedOver)
    }

    async fn act_as_follower(
        &self,
        state: &mut HaState,
        cluster: &Cluster,
        leader: &Leader,
    ) -> HaResult<Action> {
        if state.role == NodeRole::Leader {
            warn!(leader = %leader.name(), "Lease is held by another member, stepping down");
        }
        state.role = NodeRole::Follower;

        if let Some(handover) = state.handover.take() {
            info!(successor = %leader.name(), "Leadership moved");
            if let (Some(intent), Some(version)) = (&cluster.switchover, handover.intent_version) {
                if intent.version == version {
                    if let Err(e) = self.delete_intent(intent).await {
                        debug!(%e, "Could not clean up switchover request");
                    }
                }
            }
        }

        let engine = self.engine.get()?;
        if engine.role().await? == EngineRole::Primary {
            warn!(leader = %leader.name(), "Engine is primary but the lease is held elsewhere, demoting");
            engine.demote().await?;
        }

        match engine.replication_source().await? {
            Some(source) if source_matches(&source, &leader.member) => {
                trace!(%source, "Replicating from the leader");
                Ok(Action::Following)
            }
            source => {
                info!(leader = %leader.name(), ?source, "Pointing replication at the leader");
                engine.follow(&leader.member).await?;
                Ok(Action::Followed)
            }
        }
    }

    async fn act_without_leader(&self, state: &mut HaState, cluster: &Cluster) -> HaResult<Action> {
        let now = self.clock.now();

        if state.role == NodeRole::Leader {
            warn!("Own lease is no longer live, demoting");
            self.demote_engine().await;
            state.role = NodeRole::Follower;
        }

        if let Some(handover) = &state.handover {
            if !self.is_handover_timed_out(handover, now) {
                trace!("Waiting for a successor");
                return Ok(Action::AwaitingSuccessor);
            }
            warn!("Nobody took over in time, abandoning the handover");
            if let (Some(intent), Some(version)) = (&cluster.switchover, handover.intent_version) {
                if intent.version == version {
                    self.delete_intent(intent).await?;
                }
            }
            state.handover = None;
            return Ok(Action::AbandonedHandover);
        }

        if state.health.is_degraded() {
            debug!("Engine degraded, not running for leader");
            return Ok(Action::Declined);
        }

        let engine = self.engine.get()?;
        if !self.should_run(state, cluster).await? {
            return Ok(Action::Declined);
        }

        state.role = NodeRole::CandidateElecting;
        if let Err(e) = self
            .lease
            .attempt_acquire(cluster, self.name(), state.op_time)
            .await
        {
            state.role = NodeRole::Follower;
            return Err(e);
        }
        state.last_renewed = Some(self.clock.now());

        if let Err(e) = engine.promote().await {
            // still holding the lease; next cycle retries via `enforce_primary`
            error!(%e, "Promotion failed");
            state.role = NodeRole::Follower;
            return Err(e.into());
        }
        state.role = NodeRole::Leader;
        info!(op_time = %state.op_time, "Became leader");
        Ok(Action::Acquired)
    }

    /// Should this node try to take the free lease
    async fn should_run(&self, state: &mut HaState, cluster: &Cluster) -> HaResult<bool> {
        let engine = self.engine.get()?;
        let local = engine.op_time().await?;
        state.op_time = local;

        let lag = health::lag(cluster.op_time, local);
        let max_lag = self.max_lag(cluster);
        if health::is_lagging(lag, max_lag) {
            info!(lag, max_lag, "Too far behind to take over");
            return Ok(false);
        }

        let now = self.clock.now();
        let mut yielding = None;
        if let Some(intent) = cluster
            .switchover
            .as_ref()
            .map(|i| &i.value)
            .filter(|i| !self.is_intent_expired(i, now))
        {
            if intent.candidate == self.name() {
                info!("Named as the switchover candidate, taking over");
                return Ok(true);
            }
            if intent.is_handed_over() && intent.leader == self.name() {
                return Ok(false);
            }
            if let Some(candidate) = cluster.member(&intent.candidate) {
                match self.probe.status(candidate).await {
                    Ok(status) if status.is_healthy => {
                        debug!(candidate = %candidate.name, "Leaving it to the named candidate");
                        return Ok(false);
                    }
                    _ => {
                        info!(candidate = %candidate.name, "Named candidate unavailable, falling back to the healthiest member")
                    }
                }
            }
            if intent.is_handed_over() {
                yielding = Some(intent.leader.as_str());
            }
        }

        Ok(self.is_healthiest(cluster, local, yielding).await)
    }

    /// No reachable, healthy peer is a better choice than us
    ///
    /// Better means further ahead, or equally far and with a lower name.
    async fn is_healthiest(&self, cluster: &Cluster, local: OpTime, yielding: Option<&str>) -> bool {
        let peers: Vec<&Member> = cluster
            .members
            .iter()
            .filter(|m| m.name != self.name() && Some(m.name.as_str()) != yielding)
            .collect();

        for peer in self.probe_members(&peers).await {
            if !peer.is_healthy {
                continue;
            }
            if peer.role == NodeRole::Leader {
                debug!(peer = %peer.name, "Peer already acts as leader");
                return false;
            }
            if local < peer.op_time || (local == peer.op_time && peer.name.as_str() < self.name())
            {
                debug!(peer = %peer.name, peer_op_time = %peer.op_time, "Peer is a better candidate");
                return false;
            }
        }
        true
    }

    /// Schedule a switchover away from the current leader
    ///
    /// Both names may be empty: any leader, healthiest successor.
    pub async fn switchover(&self, primary: &str, candidate: &str) -> OpsResult {
        OpsResult::from_res(self.schedule_switchover(primary, candidate, false).await)
    }

    /// Like [`Self::switchover`], but works with no live leader
    pub async fn failover(&self, candidate: &str) -> OpsResult {
        OpsResult::from_res(self.schedule_switchover("", candidate, true).await)
    }

    async fn schedule_switchover(
        &self,
        primary: &str,
        candidate: &str,
        is_failover: bool,
    ) -> HaResult<String> {
        let mut state = self.state.lock().await;
        let cluster = self.refresh(&mut state).await?;
        check_switchover_request(&cluster, primary, candidate, is_failover)?;

        let now = self.clock.now();
        if let Some(stale) = cluster
            .switchover
            .as_ref()
            .filter(|i| self.is_intent_expired(&i.value, now))
        {
            self.delete_intent(stale).await?;
        }

        let intent = SwitchoverIntent {
            leader: primary.to_owned(),
            candidate: candidate.to_owned(),
            scheduled_at: now,
            handed_over_at: None,
        };
        match self
            .store
            .create(&self.keys.switchover(), intent.to_annotations())
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                return Err(SwitchoverRejection::AlreadyInProgress.into())
            }
            Err(e) => return Err(e.into()),
        }
        info!(%primary, %candidate, is_failover, "Scheduled switchover");
        Ok(if candidate.is_empty() {
            "switchover to the healthiest member scheduled".to_owned()
        } else {
            format!("switchover to {candidate} scheduled")
        })
    }

    /// Take the lease and promote the engine right away
    pub async fn promote(&self) -> OpsResult {
        OpsResult::from_res(
            self.promote_now()
                .await
                .map(|()| format!("{} promoted", self.name())),
        )
    }

    async fn promote_now(&self) -> HaResult<()> {
        let mut state = self.state.lock().await;
        let cluster = self.refresh(&mut state).await?;
        let engine = self.engine.get()?;

        if cluster.is_leader(self.name()) {
            self.lease.renew(self.name(), state.op_time, None).await?;
        } else {
            state.op_time = engine.op_time().await?;
            self.lease
                .attempt_acquire(&cluster, self.name(), state.op_time)
                .await?;
        }
        state.last_renewed = Some(self.clock.now());
        state.handover = None;

        engine.promote().await?;
        state.role = NodeRole::Leader;
        info!("Promoted on request");
        self.publish(&state);
        Ok(())
    }

    /// Demote the engine and release the lease if held
    ///
    /// The node then sits out for a handover timeout before it may run
    /// for leader again.
    pub async fn demote(&self) -> OpsResult {
        OpsResult::from_res(
            self.demote_now()
                .await
                .map(|()| format!("{} demoted", self.name())),
        )
    }

    async fn demote_now(&self) -> HaResult<()> {
        let mut state = self.state.lock().await;
        let engine = self.engine.get()?;
        engine.demote().await?;
        let op_time = engine.op_time().await.unwrap_or(state.op_time);
        self.release_lease(op_time).await?;

        state.role = NodeRole::Follower;
        state.handover = Some(Handover {
            intent_version: None,
            started_at: self.clock.now(),
        });
        info!("Demoted on request");
        self.publish(&state);
        Ok(())
    }

    /// Leave the cluster: give up leadership and drop the member record
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.role == NodeRole::Leader {
            info!("Shutting down, giving up leadership");
            self.demote_engine().await;
            if let Err(e) = self.release_lease(state.op_time).await {
                warn!(%e, "Could not release the lease");
            }
            state.role = NodeRole::Follower;
        }
        if let Err(e) = self
            .store
            .delete(&self.keys.member(self.name()), None)
            .await
        {
            warn!(%e, "Could not remove member record");
        }
        state.registered_role = None;
        self.publish(&state);
    }
}

/// Checks an operator request against the current view, before it is
/// written to the store
fn check_switchover_request(
    cluster: &Cluster,
    primary: &str,
    candidate: &str,
    is_failover: bool,
) -> Result<(), SwitchoverRejection> {
    if is_failover && candidate.is_empty() {
        return Err(SwitchoverRejection::CandidateRequired);
    }
    let leader = cluster.leader_name();
    if !primary.is_empty() && leader != Some(primary) {
        return Err(SwitchoverRejection::LeaderMismatch {
            requested: primary.to_owned(),
            current: leader.map(str::to_owned),
        });
    }
    if !is_failover && leader.is_none() {
        return Err(SwitchoverRejection::NoLeader);
    }
    if !candidate.is_empty() {
        if !cluster.has_member(candidate) {
            return Err(SwitchoverRejection::CandidateNotFound(candidate.to_owned()));
        }
        if leader == Some(candidate) {
            return Err(SwitchoverRejection::NoEligibleCandidate);
        }
    } else if !cluster
        .members
        .iter()
        .any(|m| Some(m.name.as_str()) != leader)
    {
        return Err(SwitchoverRejection::NoEligibleCandidate);
    }
    Ok(())
}
