#![deny(clippy::as_conversions)]
use hakeeperd::clock::SystemClock;
use hakeeperd::engine::EngineHandle;
use hakeeperd::ha::Backends;
use hakeeperd::probe::RpcProbe;
use hakeeperd::store::FileStore;
use opts::Opts;
use std::io;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    let backends = Backends {
        store: Arc::new(FileStore::open(&opts.store_dir)?),
        engine: EngineHandle::lazy(opts.engine.connector(opts.engine_config())),
        probe: Arc::new(RpcProbe::new(opts.rpc_timeout)),
        clock: Arc::new(SystemClock),
    };

    let node = hakeeperd::Node::new(opts.params(), backends)?;

    node.get_ctrl().install_signal_handler()?;

    node.wait();

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
