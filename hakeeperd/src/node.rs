mod ha_loop;
mod request_handler;

use crate::ha::{Backends, Ha};
use crate::node::ha_loop::HaLoop;
use crate::node::request_handler::RequestHandler;
use crate::record::Keys;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};
use typed_builder::TypedBuilder;

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    /// Member name, unique within the cluster
    pub name: String,

    #[builder(default = String::from(Parameters::DEFAULT_NAMESPACE))]
    pub namespace: String,
    pub cluster: String,
    pub component: String,

    #[builder(default = Parameters::DEFAULT_BIND_ADDR)]
    pub rpc_bind: SocketAddr,

    /// Address other members reach us at; the bound rpc address if not set
    #[builder(default, setter(strip_option))]
    pub advertise_addr: Option<String>,

    /// Port our database serves replicas on, published in the member record
    #[builder(default, setter(strip_option))]
    pub engine_port: Option<u16>,

    #[builder(default = Parameters::DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,

    /// Lease duration written to a fresh cluster config
    #[builder(default = Parameters::DEFAULT_TTL_SECS)]
    pub ttl_secs: i64,

    /// Most a member may lag behind and still take over, for a fresh cluster config
    #[builder(default = Parameters::DEFAULT_MAX_LAG_ON_SWITCHOVER)]
    pub max_lag_on_switchover: i64,

    /// Consecutive failed health checks before the engine counts as degraded
    #[builder(default = Parameters::DEFAULT_FAILURE_THRESHOLD)]
    pub failure_threshold: u32,

    /// How long a member that handed over waits for a successor
    #[builder(default = Parameters::DEFAULT_HANDOVER_TIMEOUT_SECS)]
    pub handover_timeout_secs: i64,

    /// Deadline for every store call
    #[builder(default = Parameters::DEFAULT_STORE_TIMEOUT)]
    pub store_timeout: Duration,
}

impl Parameters {
    pub const DEFAULT_NAMESPACE: &'static str = "default";
    pub const DEFAULT_BIND_ADDR: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V6(Ipv6Addr::LOCALHOST), 0);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_TTL_SECS: i64 = 30;
    pub const DEFAULT_MAX_LAG_ON_SWITCHOVER: i64 = 10;
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
    pub const DEFAULT_HANDOVER_TIMEOUT_SECS: i64 = 30;
    pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn keys(&self) -> Keys {
        Keys::new(&self.namespace, &self.cluster, &self.component)
    }
}

pub struct NodeCtrl {
    is_node_shutting_down: Arc<AtomicBool>,
    rpc_addr: SocketAddr,
}

impl NodeCtrl {
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

pub struct Node {
    is_node_shutting_down: Arc<AtomicBool>,
    stop_on_drop: bool,
    ha: Arc<Ha>,
    /// Tokio executor serving rpc connections
    request_handler: RequestHandler,
    /// Thread running the poll cycle
    #[allow(unused)]
    ha_loop: HaLoop,
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.is_node_shutting_down.store(true, Ordering::SeqCst);
        }
    }
}

impl Node {
    pub fn new(params: Parameters, backends: Backends) -> anyhow::Result<Self> {
        info!(
            name = %params.name,
            cluster = %params.cluster,
            component = %params.component,
            rpc_bind = %params.rpc_bind,
            "Starting hakeeperd"
        );

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));
        let (ha_tx, ha_rx) = flume::bounded(1);
        let request_handler =
            RequestHandler::new(params.rpc_bind, is_node_shutting_down.clone(), ha_rx)?;
        // dropped before `request_handler`, so a failure below doesn't hang joining it
        let stop_guard = scopeguard::guard(is_node_shutting_down.clone(), |flag| {
            flag.store(true, Ordering::SeqCst)
        });

        let address = params
            .advertise_addr
            .clone()
            .unwrap_or_else(|| request_handler.local_addr().to_string());
        info!(%address, "Advertising rpc address");

        let poll_interval = params.poll_interval;
        let ha = Arc::new(Ha::new(params, address, backends));
        ha_tx
            .send(ha.clone())
            .map_err(|_| anyhow::format_err!("RequestHandler exited early"))?;

        let ha_loop = HaLoop::new(ha.clone(), is_node_shutting_down.clone(), poll_interval)?;

        scopeguard::ScopeGuard::into_inner(stop_guard);
        Ok(Node {
            is_node_shutting_down,
            stop_on_drop: true,
            ha,
            request_handler,
            ha_loop,
        })
    }

    pub fn ha(&self) -> &Arc<Ha> {
        &self.ha
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            is_node_shutting_down: Arc::clone(&self.is_node_shutting_down),
            rpc_addr: self.request_handler.local_addr(),
        }
    }

    pub fn wait(mut self) {
        self.stop_on_drop = false;
        drop(self);
        info!("Node finished");
    }
}
