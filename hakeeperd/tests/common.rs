#![allow(unused)]

use async_trait::async_trait;
use hakeeper_api::{NodeRole, OpTime};
use hakeeperd::clock::{ManualClock, SystemClock, UnixTime};
use hakeeperd::cluster::Member;
use hakeeperd::engine::{EngineHandle, SimEngine};
use hakeeperd::error::HaResult;
use hakeeperd::ha::{Action, Backends, Ha};
use hakeeperd::probe::{PeerProbe, PeerStatus, ProbeError, RpcProbe};
use hakeeperd::record::{Keys, LeaderRecord, SwitchoverIntent};
use hakeeperd::store::{MemStore, Store};
use hakeeperd::Parameters;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub const T0: UnixTime = UnixTime(1_700_000_000);

pub fn params(name: &str) -> Parameters {
    Parameters::builder()
        .name(name.to_owned())
        .cluster("orders".to_owned())
        .component("mysql".to_owned())
        .ttl_secs(30)
        .max_lag_on_switchover(10)
        .failure_threshold(3)
        // long enough to never fire by accident
        .handover_timeout_secs(300)
        .build()
}

/// Answers probes straight from the other in-process coordinators
#[derive(Default)]
pub struct LocalProbe {
    peers: Mutex<BTreeMap<String, Weak<Ha>>>,
    unreachable: Mutex<BTreeSet<String>>,
}

impl LocalProbe {
    pub fn add(&self, ha: &Arc<Ha>) {
        self.peers
            .lock()
            .expect("Locking failed")
            .insert(ha.name().to_owned(), Arc::downgrade(ha));
    }

    pub fn set_reachable(&self, name: &str, is_reachable: bool) {
        let mut unreachable = self.unreachable.lock().expect("Locking failed");
        if is_reachable {
            unreachable.remove(name);
        } else {
            unreachable.insert(name.to_owned());
        }
    }
}

#[async_trait]
impl PeerProbe for LocalProbe {
    async fn status(&self, member: &Member) -> Result<PeerStatus, ProbeError> {
        let unreachable = || ProbeError::Unreachable {
            name: member.name.clone(),
            message: "switched off".into(),
        };
        if self
            .unreachable
            .lock()
            .expect("Locking failed")
            .contains(&member.name)
        {
            return Err(unreachable());
        }
        let ha = self
            .peers
            .lock()
            .expect("Locking failed")
            .get(&member.name)
            .and_then(Weak::upgrade)
            .ok_or_else(unreachable)?;
        let status = ha.status();
        Ok(PeerStatus::from(&*status))
    }
}

pub struct TestMember {
    pub ha: Arc<Ha>,
    pub engine: Arc<SimEngine>,
}

/// A few coordinators sharing one store and one clock, cycled by hand
pub struct TestCluster {
    pub store: Arc<MemStore>,
    pub clock: Arc<ManualClock>,
    pub probe: Arc<LocalProbe>,
    pub members: Vec<TestMember>,
}

impl TestCluster {
    /// Every engine starts as a secondary at op-time 100
    pub fn new(names: &[&str]) -> Self {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let probe = Arc::new(LocalProbe::default());

        let members = names
            .iter()
            .map(|name| {
                let engine = Arc::new(SimEngine::secondary());
                engine.set_op_time(OpTime(100));
                let ha = Arc::new(Ha::new(
                    params(name),
                    format!("{name}:3501"),
                    Backends {
                        store: store.clone(),
                        engine: EngineHandle::ready(engine.clone()),
                        probe: probe.clone(),
                        clock: clock.clone(),
                    },
                ));
                probe.add(&ha);
                TestMember { ha, engine }
            })
            .collect();

        Self {
            store,
            clock,
            probe,
            members,
        }
    }

    pub fn member(&self, name: &str) -> &TestMember {
        self.members
            .iter()
            .find(|m| m.ha.name() == name)
            .expect("no such member")
    }

    pub fn keys(&self) -> Keys {
        params("any").keys()
    }

    /// Move the clock to `secs` after [`T0`]
    pub fn at(&self, secs: i64) {
        self.clock.set(T0.plus_secs(secs));
    }

    pub async fn cycle(&self, name: &str) -> HaResult<Action> {
        self.member(name).ha.run_cycle().await
    }

    /// One cycle of every member, in order
    pub async fn cycle_all(&self) -> Vec<HaResult<Action>> {
        let mut res = vec![];
        for m in &self.members {
            res.push(m.ha.run_cycle().await);
        }
        res
    }

    /// Members that believe they are the leader
    pub fn leaders(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.ha.status().role == NodeRole::Leader)
            .map(|m| m.ha.name().to_owned())
            .collect()
    }

    pub async fn stored_leader(&self) -> Option<LeaderRecord> {
        self.store
            .get(&self.keys().leader())
            .await
            .expect("store available")
            .map(|e| LeaderRecord::from_annotations(&e.annotations))
    }

    pub async fn stored_switchover(&self) -> Option<SwitchoverIntent> {
        self.store
            .get(&self.keys().switchover())
            .await
            .expect("store available")
            .map(|e| SwitchoverIntent::from_annotations(&e.annotations))
    }
}

/// A full node with an rpc port, a simulated engine and real time
pub struct TestNode {
    pub engine: Arc<SimEngine>,
    node: Option<hakeeperd::Node>,
}

impl TestNode {
    pub fn new(name: &str, store: Arc<MemStore>) -> anyhow::Result<Self> {
        let params = Parameters::builder()
            .name(name.to_owned())
            .cluster("orders".to_owned())
            .component("mysql".to_owned())
            .rpc_bind("127.0.0.1:0".parse()?)
            .poll_interval(Duration::from_millis(50))
            .store_timeout(Duration::from_millis(500))
            .build();
        let engine = Arc::new(SimEngine::secondary());
        let backends = Backends {
            store,
            engine: EngineHandle::ready(engine.clone()),
            probe: Arc::new(RpcProbe::new(Duration::from_millis(500))),
            clock: Arc::new(SystemClock),
        };
        let node = hakeeperd::Node::new(params, backends)?;
        Ok(Self {
            engine,
            node: Some(node),
        })
    }

    pub fn node(&self) -> &hakeeperd::Node {
        self.node.as_ref().expect("Node was already dropped")
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node().get_ctrl().rpc_addr()
    }

    pub fn role(&self) -> NodeRole {
        self.node().ha().status().role
    }

    pub fn leader_name(&self) -> Option<String> {
        self.node().ha().status().leader_name().map(str::to_owned)
    }

    pub async fn client(&self) -> anyhow::Result<hakeeper::Client> {
        Ok(hakeeper::Client::connect(self.local_addr()).await?)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.node().get_ctrl().stop();
        self.node.take();
    }
}

/// Poll `f` until it holds, for up to 10s
pub async fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
