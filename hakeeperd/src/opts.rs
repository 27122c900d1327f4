use clap::Parser;
use hakeeperd::engine::{EngineConfig, EngineKind, Operation, Secret};
use hakeeperd::Parameters;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;
use std::{net::SocketAddr, path::PathBuf};

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    /// This member's name
    #[clap(long, env = "HAKEEPER_NAME")]
    pub name: String,

    #[clap(long, env = "HAKEEPER_NAMESPACE", default_value = Parameters::DEFAULT_NAMESPACE)]
    pub namespace: String,

    #[clap(long, env = "HAKEEPER_CLUSTER")]
    pub cluster: String,

    #[clap(long, env = "HAKEEPER_COMPONENT")]
    pub component: String,

    #[clap(long = "listen", env = "HAKEEPER_LISTEN", default_value = "127.0.0.1:3501")]
    pub listen: SocketAddr,

    /// `host:port` other members reach this one at
    #[clap(long = "advertise", env = "HAKEEPER_ADVERTISE")]
    pub advertise: Option<String>,

    /// Directory of the file-backed coordination store, shared by all members
    #[clap(long = "store-dir", env = "HAKEEPER_STORE_DIR", default_value = "/var/lib/hakeeper")]
    pub store_dir: PathBuf,

    #[clap(long, value_enum, env = "HAKEEPER_ENGINE", default_value = "mysql")]
    pub engine: EngineKind,

    #[clap(long = "db-user", env = "HAKEEPER_DB_USER", default_value = "root")]
    pub db_user: String,

    #[clap(
        long = "db-password",
        env = "HAKEEPER_DB_PASSWORD",
        default_value = "",
        hide_env_values = true
    )]
    pub db_password: String,

    #[clap(long = "db-port", env = "HAKEEPER_DB_PORT")]
    pub db_port: Option<u16>,

    /// Replace a built-in engine script, as `<operation>=<script>`
    #[clap(long = "engine-command", value_parser = parse_command_override)]
    pub engine_commands: Vec<(Operation, String)>,

    #[clap(long = "engine-timeout", value_parser = parse_duration, default_value = "5s")]
    pub engine_timeout: Duration,

    #[clap(long = "ttl", default_value_t = Parameters::DEFAULT_TTL_SECS)]
    pub ttl_secs: i64,

    #[clap(long = "max-lag", default_value_t = Parameters::DEFAULT_MAX_LAG_ON_SWITCHOVER)]
    pub max_lag: i64,

    #[clap(long = "poll-interval", value_parser = parse_duration, default_value = "1s")]
    pub poll_interval: Duration,

    #[clap(long = "failure-threshold", default_value_t = Parameters::DEFAULT_FAILURE_THRESHOLD)]
    pub failure_threshold: u32,

    #[clap(long = "handover-timeout", default_value_t = Parameters::DEFAULT_HANDOVER_TIMEOUT_SECS)]
    pub handover_timeout_secs: i64,

    /// Deadline for store calls and peer probes
    #[clap(long = "rpc-timeout", value_parser = parse_duration, default_value = "2s")]
    pub rpc_timeout: Duration,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }

    pub fn params(&self) -> Parameters {
        let mut params = Parameters::builder()
            .name(self.name.clone())
            .namespace(self.namespace.clone())
            .cluster(self.cluster.clone())
            .component(self.component.clone())
            .rpc_bind(self.listen)
            .poll_interval(self.poll_interval)
            .ttl_secs(self.ttl_secs)
            .max_lag_on_switchover(self.max_lag)
            .failure_threshold(self.failure_threshold)
            .handover_timeout_secs(self.handover_timeout_secs)
            .store_timeout(self.rpc_timeout)
            .build();
        params.advertise_addr = self.advertise.clone();
        if self.engine != EngineKind::Sim {
            params.engine_port = Some(self.engine_config().port());
        }
        params
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::builder()
            .kind(self.engine)
            .user(self.db_user.clone())
            .password(Secret(self.db_password.clone()))
            .command_timeout(self.engine_timeout)
            .overrides(self.engine_commands.iter().cloned().collect())
            .build();
        config.port = self.db_port;
        config
    }
}

fn parse_command_override(s: &str) -> Result<(Operation, String), String> {
    let (op, script) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <operation>=<script>, got: {s}"))?;
    Ok((op.trim().parse()?, script.to_owned()))
}

fn parse_duration(s: &str) -> std::result::Result<Duration, ParseIntError> {
    let s = s.trim().to_lowercase();

    Ok(if let Some(num) = s.strip_suffix("ms") {
        Duration::from_millis(u64::from_str(num)?)
    } else if let Some(num) = s.strip_suffix('s') {
        Duration::from_secs(u64::from_str(num)?)
    } else if let Some(num) = s.strip_suffix('m') {
        Duration::from_secs(u64::from_str(num)? * 60)
    } else {
        Duration::from_millis(u64::from_str(&s)?)
    })
}

#[test]
fn parse_duration_test() {
    assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
    assert_eq!(parse_duration("250"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
    assert_eq!(parse_duration("3M"), Ok(Duration::from_secs(180)));
    assert!(parse_duration("s").is_err());
    assert!(parse_duration("1h").is_err());
}

#[test]
fn parse_command_override_test() {
    assert_eq!(
        parse_command_override("health-check=pg_isready -q"),
        Ok((Operation::HealthCheck, "pg_isready -q".to_owned()))
    );
    assert_eq!(
        parse_command_override("follow=a=b"),
        Ok((Operation::Follow, "a=b".to_owned()))
    );
    assert!(parse_command_override("nonsense").is_err());
    assert!(parse_command_override("vacuum=true").is_err());
}

#[test]
fn opts_to_params() {
    let opts = Opts::parse_from([
        "hakeeperd",
        "--name",
        "mysql-0",
        "--cluster",
        "orders",
        "--component",
        "mysql",
        "--advertise",
        "mysql-0.svc:3501",
        "--engine-command",
        "role=echo 0",
    ]);
    let params = opts.params();
    assert_eq!(params.keys().leader(), "default.orders-mysql-leader");
    assert_eq!(params.advertise_addr.as_deref(), Some("mysql-0.svc:3501"));
    // replicas connect to the database, not to our rpc port
    assert_eq!(params.engine_port, Some(3306));
    let config = opts.engine_config();
    assert_eq!(config.port(), 3306);
    assert_eq!(config.overrides.get(&Operation::Role).map(String::as_str), Some("echo 0"));
}
