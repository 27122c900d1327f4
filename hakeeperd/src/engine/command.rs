//! Engines driven through their own command line clients
//!
//! Every operation is a small shell script. Its stdout is decoded
//! according to a per-operation [`OutputShape`], so a query can never
//! quietly turn into the wrong kind of value.

use async_trait::async_trait;
use hakeeper_api::{EngineRole, OpTime};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{
    Connector, Engine, EngineConfig, EngineError, EngineKind, EngineResult, Operation,
};
use crate::cluster::Member;

/// What an operation's stdout is expected to contain
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputShape {
    /// Nothing of interest, exit status is all that matters
    Unit,
    /// Primary iff the value equals `primary_when`
    Role {
        field: Option<&'static str>,
        primary_when: &'static str,
    },
    Integer { field: Option<&'static str> },
    /// Empty output decodes as `None`
    Text { field: Option<&'static str> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    Unit,
    Role(EngineRole),
    Integer(i64),
    Text(Option<String>),
}

/// Value of `field` in `key<sep>value` style output, or the first
/// non-empty line if `field` is `None`
fn field_value<'s>(stdout: &'s str, field: Option<&str>) -> Option<&'s str> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let Some(field) = field else {
        return lines.next();
    };
    lines.find_map(|line| {
        let (key, value) =
            line.split_once(|c: char| c == ':' || c == '=' || c.is_whitespace())?;
        (key == field).then(|| value.trim())
    })
}

impl OutputShape {
    pub fn decode(&self, operation: Operation, stdout: &str) -> EngineResult<Decoded> {
        let decode_err = || EngineError::Decode {
            operation,
            output: stdout.to_owned(),
        };
        Ok(match self {
            OutputShape::Unit => Decoded::Unit,
            OutputShape::Role {
                field,
                primary_when,
            } => {
                let value = field_value(stdout, *field).ok_or_else(decode_err)?;
                Decoded::Role(if value.eq_ignore_ascii_case(primary_when) {
                    EngineRole::Primary
                } else {
                    EngineRole::Secondary
                })
            }
            OutputShape::Integer { field } => Decoded::Integer(
                field_value(stdout, *field)
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(decode_err)?,
            ),
            OutputShape::Text { field } => Decoded::Text(
                field_value(stdout, *field)
                    .filter(|v| !v.is_empty())
                    .map(str::to_owned),
            ),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub script: String,
    pub shape: OutputShape,
}

impl CommandSpec {
    fn new(script: impl Into<String>, shape: OutputShape) -> Self {
        Self {
            script: script.into(),
            shape,
        }
    }
}

const MYSQL: &str = r#"mysql -h127.0.0.1 -P"$HAKEEPER_PORT" -u"$HAKEEPER_USER" -p"$HAKEEPER_PASSWORD" -N -s"#;
const PSQL: &str = r#"PGPASSWORD="$HAKEEPER_PASSWORD" psql -h 127.0.0.1 -p "$HAKEEPER_PORT" -U "$HAKEEPER_USER" -At"#;
const REDIS: &str = r#"redis-cli -h 127.0.0.1 -p "$HAKEEPER_PORT" --user "$HAKEEPER_USER" --pass "$HAKEEPER_PASSWORD" --no-auth-warning"#;

fn mysql_commands() -> BTreeMap<Operation, CommandSpec> {
    use OutputShape::*;
    BTreeMap::from([
        (
            Operation::Role,
            CommandSpec::new(
                format!(r#"{MYSQL} -e "select @@global.read_only""#),
                Role {
                    field: None,
                    primary_when: "0",
                },
            ),
        ),
        (
            Operation::OpTime,
            CommandSpec::new(
                format!(r#"{MYSQL} -e "show global status like 'Innodb_redo_log_current_lsn'""#),
                Integer {
                    field: Some("Innodb_redo_log_current_lsn"),
                },
            ),
        ),
        (
            Operation::Promote,
            CommandSpec::new(
                format!(r#"{MYSQL} -e "stop replica; set global super_read_only=off; set global read_only=off""#),
                Unit,
            ),
        ),
        (
            Operation::Demote,
            CommandSpec::new(format!(r#"{MYSQL} -e "set global read_only=on""#), Unit),
        ),
        (
            Operation::Follow,
            CommandSpec::new(
                format!(
                    r#"{MYSQL} -e "stop replica; change replication source to source_host='$HAKEEPER_LEADER_HOST', source_port=$HAKEEPER_LEADER_PORT, source_user='$HAKEEPER_USER', source_password='$HAKEEPER_PASSWORD', source_auto_position=1; start replica""#
                ),
                Unit,
            ),
        ),
        (
            Operation::ReplicationSource,
            CommandSpec::new(
                format!(r#"{MYSQL} -e "select host from performance_schema.replication_connection_configuration""#),
                Text { field: None },
            ),
        ),
        (
            Operation::HealthCheck,
            CommandSpec::new(format!(r#"{MYSQL} -e "select 1""#), Unit),
        ),
        (
            Operation::SysId,
            CommandSpec::new(
                format!(r#"{MYSQL} -e "select @@global.server_uuid""#),
                Text { field: None },
            ),
        ),
    ])
}

fn postgres_commands() -> BTreeMap<Operation, CommandSpec> {
    use OutputShape::*;
    BTreeMap::from([
        (
            Operation::Role,
            CommandSpec::new(
                format!(r#"{PSQL} -c "select pg_is_in_recovery()""#),
                Role {
                    field: None,
                    primary_when: "f",
                },
            ),
        ),
        (
            Operation::OpTime,
            CommandSpec::new(
                format!(
                    r#"{PSQL} -c "select pg_wal_lsn_diff(case when pg_is_in_recovery() then pg_last_wal_replay_lsn() else pg_current_wal_lsn() end, '0/0')::bigint""#
                ),
                Integer { field: None },
            ),
        ),
        (
            Operation::Promote,
            CommandSpec::new(
                format!(
                    r#"{PSQL} -c "alter system set default_transaction_read_only = off" -c "select pg_reload_conf()" -c "select pg_promote()""#
                ),
                Unit,
            ),
        ),
        (
            Operation::Demote,
            CommandSpec::new(
                format!(
                    r#"{PSQL} -c "alter system set default_transaction_read_only = on" -c "select pg_reload_conf()""#
                ),
                Unit,
            ),
        ),
        (
            Operation::Follow,
            CommandSpec::new(
                format!(
                    r#"{PSQL} -c "alter system set primary_conninfo = 'host=$HAKEEPER_LEADER_HOST port=$HAKEEPER_LEADER_PORT user=$HAKEEPER_USER'" -c "select pg_reload_conf()""#
                ),
                Unit,
            ),
        ),
        (
            Operation::ReplicationSource,
            CommandSpec::new(
                format!(r#"{PSQL} -c "select sender_host from pg_stat_wal_receiver""#),
                Text { field: None },
            ),
        ),
        (
            Operation::HealthCheck,
            CommandSpec::new(
                r#"pg_isready -h 127.0.0.1 -p "$HAKEEPER_PORT""#,
                Unit,
            ),
        ),
        (
            Operation::SysId,
            CommandSpec::new(
                format!(r#"{PSQL} -c "select system_identifier from pg_control_system()""#),
                Text { field: None },
            ),
        ),
    ])
}

fn redis_commands() -> BTreeMap<Operation, CommandSpec> {
    use OutputShape::*;
    BTreeMap::from([
        (
            Operation::Role,
            CommandSpec::new(
                format!("{REDIS} role"),
                Role {
                    field: None,
                    primary_when: "master",
                },
            ),
        ),
        (
            Operation::OpTime,
            CommandSpec::new(
                format!("{REDIS} info replication"),
                Integer {
                    field: Some("master_repl_offset"),
                },
            ),
        ),
        (
            Operation::Promote,
            CommandSpec::new(
                format!("{REDIS} client unpause && {REDIS} replicaof no one"),
                Unit,
            ),
        ),
        (
            Operation::Demote,
            CommandSpec::new(format!("{REDIS} client pause 600000 write"), Unit),
        ),
        (
            Operation::Follow,
            CommandSpec::new(
                format!(
                    r#"{REDIS} replicaof "$HAKEEPER_LEADER_HOST" "$HAKEEPER_LEADER_PORT" && {REDIS} client unpause"#
                ),
                Unit,
            ),
        ),
        (
            Operation::ReplicationSource,
            CommandSpec::new(
                format!("{REDIS} info replication"),
                Text {
                    field: Some("master_host"),
                },
            ),
        ),
        (
            Operation::HealthCheck,
            CommandSpec::new(format!("{REDIS} ping | grep -q PONG"), Unit),
        ),
        (
            Operation::SysId,
            CommandSpec::new(
                format!("{REDIS} info server"),
                Text {
                    field: Some("run_id"),
                },
            ),
        ),
    ])
}

fn default_commands(kind: EngineKind) -> BTreeMap<Operation, CommandSpec> {
    match kind {
        EngineKind::MySql => mysql_commands(),
        EngineKind::Postgres => postgres_commands(),
        EngineKind::Redis => redis_commands(),
        EngineKind::Sim => BTreeMap::new(),
    }
}

pub struct CommandEngine {
    config: EngineConfig,
    commands: BTreeMap<Operation, CommandSpec>,
}

impl CommandEngine {
    pub fn new(config: EngineConfig) -> Self {
        let mut commands = default_commands(config.kind);
        for (op, script) in &config.overrides {
            let shape = commands
                .get(op)
                .map(|spec| spec.shape.clone())
                .unwrap_or_else(|| default_shape(*op));
            commands.insert(*op, CommandSpec::new(script.clone(), shape));
        }
        Self { config, commands }
    }

    async fn run(&self, op: Operation, leader: Option<&Member>) -> EngineResult<Decoded> {
        let spec = self
            .commands
            .get(&op)
            .ok_or_else(|| EngineError::CommandFailed {
                operation: op,
                message: "no command configured".into(),
            })?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.script)
            .env("HAKEEPER_USER", &self.config.user)
            .env("HAKEEPER_PASSWORD", &self.config.password.0)
            .env("HAKEEPER_PORT", self.config.port().to_string())
            .kill_on_drop(true);
        if let Some(leader) = leader {
            cmd.env("HAKEEPER_LEADER_NAME", &leader.name)
                .env("HAKEEPER_LEADER_HOST", leader.host())
                // never the coordinator port from `address`
                .env(
                    "HAKEEPER_LEADER_PORT",
                    leader
                        .engine_port
                        .unwrap_or_else(|| self.config.port())
                        .to_string(),
                );
        }

        trace!(%op, "Running engine command");
        let output = timeout(self.config.command_timeout, cmd.output())
            .await
            .map_err(|_| EngineError::Timeout {
                operation: op,
                timeout: self.config.command_timeout,
            })?
            .map_err(|e| EngineError::CommandFailed {
                operation: op,
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                operation: op,
                message: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(%op, stdout = %stdout.trim(), "Engine command done");
        spec.shape.decode(op, &stdout)
    }

    async fn run_expecting<T>(
        &self,
        op: Operation,
        leader: Option<&Member>,
        f: impl FnOnce(Decoded) -> Option<T>,
    ) -> EngineResult<T> {
        let decoded = self.run(op, leader).await?;
        f(decoded.clone()).ok_or_else(|| EngineError::Decode {
            operation: op,
            output: format!("{decoded:?}"),
        })
    }
}

/// Shape an overridden operation is decoded with when the engine kind
/// has no built-in command for it
fn default_shape(op: Operation) -> OutputShape {
    match op {
        Operation::Role => OutputShape::Role {
            field: None,
            primary_when: "primary",
        },
        Operation::OpTime => OutputShape::Integer { field: None },
        Operation::ReplicationSource | Operation::SysId => OutputShape::Text { field: None },
        Operation::Promote | Operation::Demote | Operation::Follow | Operation::HealthCheck => {
            OutputShape::Unit
        }
    }
}

#[async_trait]
impl Engine for CommandEngine {
    async fn role(&self) -> EngineResult<EngineRole> {
        self.run_expecting(Operation::Role, None, |d| match d {
            Decoded::Role(role) => Some(role),
            _ => None,
        })
        .await
    }

    async fn op_time(&self) -> EngineResult<OpTime> {
        self.run_expecting(Operation::OpTime, None, |d| match d {
            Decoded::Integer(v) => Some(OpTime(v)),
            _ => None,
        })
        .await
    }

    async fn promote(&self) -> EngineResult<()> {
        self.run(Operation::Promote, None).await.map(|_| ())
    }

    async fn demote(&self) -> EngineResult<()> {
        self.run(Operation::Demote, None).await.map(|_| ())
    }

    async fn follow(&self, leader: &Member) -> EngineResult<()> {
        self.run(Operation::Follow, Some(leader)).await.map(|_| ())
    }

    async fn replication_source(&self) -> EngineResult<Option<String>> {
        self.run_expecting(Operation::ReplicationSource, None, |d| match d {
            Decoded::Text(v) => Some(v),
            _ => None,
        })
        .await
    }

    async fn health_check(&self) -> EngineResult<()> {
        self.run(Operation::HealthCheck, None).await.map(|_| ())
    }

    async fn sys_id(&self) -> EngineResult<String> {
        self.run_expecting(Operation::SysId, None, |d| match d {
            Decoded::Text(v) => Some(v.unwrap_or_default()),
            _ => None,
        })
        .await
    }
}

/// Connected once the engine answers its health check
pub(super) struct CommandConnector {
    config: EngineConfig,
}

impl CommandConnector {
    pub(super) fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for CommandConnector {
    async fn connect(&self) -> EngineResult<Arc<dyn Engine>> {
        let engine = CommandEngine::new(self.config.clone());
        engine.health_check().await?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_field_output() {
        let shape = OutputShape::Integer {
            field: Some("master_repl_offset"),
        };
        let info = "# Replication\r\nrole:master\r\nmaster_repl_offset_x:1\r\nmaster_repl_offset:4242\r\n";
        assert_eq!(
            shape.decode(Operation::OpTime, info),
            Ok(Decoded::Integer(4242))
        );

        let tabbed = "Innodb_redo_log_current_lsn\t19876\n";
        let shape = OutputShape::Integer {
            field: Some("Innodb_redo_log_current_lsn"),
        };
        assert_eq!(
            shape.decode(Operation::OpTime, tabbed),
            Ok(Decoded::Integer(19876))
        );

        assert!(matches!(
            shape.decode(Operation::OpTime, "Innodb_redo_log_current_lsn\tNULL\n"),
            Err(EngineError::Decode { .. })
        ));
    }

    #[test]
    fn decode_role_and_text() {
        let role = OutputShape::Role {
            field: None,
            primary_when: "f",
        };
        assert_eq!(
            role.decode(Operation::Role, "f\n"),
            Ok(Decoded::Role(EngineRole::Primary))
        );
        assert_eq!(
            role.decode(Operation::Role, "t\n"),
            Ok(Decoded::Role(EngineRole::Secondary))
        );
        assert!(role.decode(Operation::Role, "\n").is_err());

        let text = OutputShape::Text { field: None };
        assert_eq!(text.decode(Operation::ReplicationSource, "\n"), Ok(Decoded::Text(None)));
    }

    fn engine_with(overrides: &[(Operation, &str)]) -> CommandEngine {
        CommandEngine::new(
            EngineConfig::builder()
                .kind(EngineKind::MySql)
                .overrides(
                    overrides
                        .iter()
                        .map(|(op, script)| (*op, script.to_string()))
                        .collect(),
                )
                .build(),
        )
    }

    #[tokio::test]
    async fn runs_overridden_scripts() {
        let engine = engine_with(&[
            (Operation::Role, "echo 1"),
            (
                Operation::OpTime,
                r#"printf 'Innodb_redo_log_current_lsn\t%s\n' "$HAKEEPER_PORT""#,
            ),
            (Operation::Follow, r#"test "$HAKEEPER_LEADER_HOST" = db-1.svc"#),
            (Operation::Promote, "echo nope >&2; exit 3"),
        ]);

        assert_eq!(engine.role().await, Ok(EngineRole::Secondary));
        assert_eq!(engine.op_time().await, Ok(OpTime(3306)));

        let leader = Member {
            name: "db-1".into(),
            address: "db-1.svc:3501".into(),
            ..Member::default()
        };
        engine.follow(&leader).await.unwrap();

        match engine.promote().await {
            Err(EngineError::CommandFailed { operation, message }) => {
                assert_eq!(operation, Operation::Promote);
                assert!(message.contains("nope"), "{message}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn follow_uses_leader_engine_port() {
        let leader = Member {
            name: "db-1".into(),
            address: "db-1.svc:3501".into(),
            engine_port: Some(3307),
            ..Member::default()
        };
        let engine = engine_with(&[(
            Operation::Follow,
            r#"test "$HAKEEPER_LEADER_PORT" = 3307 || { echo "port=$HAKEEPER_LEADER_PORT" >&2; exit 1; }"#,
        )]);
        engine.follow(&leader).await.unwrap();

        // not published: assume the same port as ours
        let leader = Member {
            engine_port: None,
            ..leader
        };
        let engine = engine_with(&[(
            Operation::Follow,
            r#"test "$HAKEEPER_LEADER_PORT" = "$HAKEEPER_PORT" || { echo "port=$HAKEEPER_LEADER_PORT" >&2; exit 1; }"#,
        )]);
        engine.follow(&leader).await.unwrap();
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let mut config = EngineConfig::builder().kind(EngineKind::Redis).build();
        config.command_timeout = std::time::Duration::from_millis(50);
        config.overrides.insert(Operation::HealthCheck, "sleep 5".into());
        let engine = CommandEngine::new(config);
        assert!(matches!(
            engine.health_check().await,
            Err(EngineError::Timeout { .. })
        ));
    }
}
