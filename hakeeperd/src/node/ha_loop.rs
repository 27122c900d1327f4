use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::error::HaError;
use crate::ha::Ha;
use crate::task::{AutoJoinHandle, PanicGuard};

/// Thread running the poll cycle
pub struct HaLoop {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl HaLoop {
    pub fn new(
        ha: Arc<Ha>,
        is_node_shutting_down: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let rt = tokio::runtime::Runtime::new()?;

        let join_handle = AutoJoinHandle::spawn("ha-loop", move || {
            let _guard = scopeguard::guard((), |_| {
                info!("HaLoop is done");
            });
            rt.block_on(async {
                let panic_guard = PanicGuard::new("ha-loop", is_node_shutting_down.clone());

                while !is_node_shutting_down.load(Ordering::SeqCst) {
                    match ha.run_cycle().await {
                        Ok(action) => trace!(?action, "Cycle done"),
                        Err(e) => log_cycle_error(&e),
                    }
                    sleep(poll_interval).await;
                }

                ha.shutdown().await;
                panic_guard.done();
            });
        })?;

        Ok(Self { join_handle })
    }
}

fn log_cycle_error(e: &HaError) {
    match e {
        HaError::NotReady | HaError::LeaseHeld { .. } => debug!(%e, "Cycle skipped"),
        HaError::Unavailable(_) | HaError::Conflict { .. } => info!(%e, "Cycle interrupted"),
        HaError::LostLock { .. } | HaError::PreconditionFailed(_) => warn!(%e, "Cycle failed"),
        HaError::EngineCommandFailed(_) => error!(%e, "Cycle failed"),
    }
}
