use clap::{Parser, Subcommand};
use derive_more::Display;
use error_stack::{Context, IntoReport, Report, ResultExt};
use hakeeper::{Client, Health, OpsEvent, OpsResponse};
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Display)]
#[display(fmt = "application error")]
pub struct AppError;

impl Context for AppError {}

pub type AppResult<T> = error_stack::Result<T, AppError>;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    /// Rpc address of the hakeeperd to talk to
    #[clap(
        long = "server",
        env = "HAKEEPER_SERVER",
        default_value = "127.0.0.1:3501"
    )]
    pub server_addr: String,

    #[clap(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Node and cluster status as seen by the server
    Status,
    /// Move the primary role away from the current primary
    Switchover {
        /// Expected current primary; refused if it is someone else
        #[clap(long)]
        primary: Option<String>,
        /// Member to hand over to; the healthiest one if not given
        #[clap(long)]
        candidate: Option<String>,
    },
    /// Move the primary role to `candidate`, even with no live primary
    Failover {
        #[clap(long)]
        candidate: String,
    },
    /// Make the server's own member the primary
    Promote,
    /// Make the server's own member give up the primary role
    Demote,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();

    let opts = Opts::parse();

    let mut client = Client::connect(opts.server_addr.as_str())
        .await
        .report()
        .change_context(AppError)
        .attach_printable_lazy(|| format!("could not connect to {}", opts.server_addr))?;

    let res = match opts.cmd {
        Command::Status => {
            let status = client
                .status()
                .await
                .report()
                .change_context(AppError)?;
            let leader = status.leader.to_option();
            println!("name:     {}", status.name.to_string_lossy());
            println!("role:     {}", status.role.as_hint());
            println!("leader:   {}", leader.as_deref().unwrap_or("<none>"));
            println!("op-time:  {}", status.op_time);
            println!("lag:      {}", status.lag);
            println!(
                "health:   {}",
                match status.health {
                    Health::Healthy => "healthy",
                    Health::Degraded => "degraded",
                }
            );
            if status.event == OpsEvent::Failed {
                return Err(failed(&status.message.to_string_lossy()));
            }
            return Ok(());
        }
        Command::Switchover { primary, candidate } => {
            client
                .switchover(primary.as_deref(), candidate.as_deref())
                .await
        }
        Command::Failover { candidate } => client.failover(&candidate).await,
        Command::Promote => client.promote().await,
        Command::Demote => client.demote().await,
    }
    .report()
    .change_context(AppError)?;

    report_ops(res)
}

fn report_ops(res: OpsResponse) -> AppResult<()> {
    let message = res.message.to_string_lossy();
    match res.event {
        OpsEvent::Success => {
            println!("{message}");
            Ok(())
        }
        OpsEvent::Failed => Err(failed(&message)),
    }
}

fn failed(message: &str) -> Report<AppError> {
    Report::new(AppError).attach_printable(format!("request failed: {message}"))
}
