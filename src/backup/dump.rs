use std::process::Stdio;
use tokio::process::Command;

use crate::model::{Connection, DatabaseEngine};

/// A fully resolved dump invocation. Secrets only travel in `env`.
#[derive(Clone)]
pub struct DumpCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl std::fmt::Debug for DumpCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_names: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("DumpCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_names)
            .finish()
    }
}

impl DumpCommand {
    /// stdin closed, stdout and stderr piped, killed if the handle is dropped.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub trait DumpCommandBuilder: Send + Sync {
    fn build(&self, connection: &Connection, database: &str, password: &str) -> DumpCommand;

    /// Runs a single statement through the engine's client, printing bare
    /// result rows one per line.
    fn query(&self, connection: &Connection, database: &str, password: &str, sql: &str) -> DumpCommand {
        client_query(connection, database, password, sql)
    }
}

fn password_env(engine: DatabaseEngine, password: &str) -> Vec<(String, String)> {
    if password.is_empty() {
        return Vec::new();
    }
    let var = match engine {
        DatabaseEngine::MySql | DatabaseEngine::MariaDb => "MYSQL_PWD",
        DatabaseEngine::PostgreSql => "PGPASSWORD",
    };
    vec![(var.to_string(), password.to_string())]
}

fn client_query(connection: &Connection, database: &str, password: &str, sql: &str) -> DumpCommand {
    let port = connection.port.to_string();
    let args = match connection.engine {
        DatabaseEngine::MySql | DatabaseEngine::MariaDb => vec![
            "-h",
            &connection.host,
            "-P",
            &port,
            "-u",
            &connection.username,
            "-N",
            "-B",
            "-e",
            sql,
            database,
        ],
        DatabaseEngine::PostgreSql => vec![
            "-h",
            &connection.host,
            "-p",
            &port,
            "-U",
            &connection.username,
            "-d",
            database,
            "--no-password",
            "-At",
            "-c",
            sql,
        ],
    };

    DumpCommand {
        program: connection.engine.client_tool().to_string(),
        args: args.into_iter().map(str::to_string).collect(),
        env: password_env(connection.engine, password),
    }
}

/// `mysqldump` for MySQL and MariaDB, `pg_dump` for PostgreSQL.
#[derive(Debug, Default, Clone, Copy)]
pub struct VendorDumpCommands;

impl DumpCommandBuilder for VendorDumpCommands {
    fn build(&self, connection: &Connection, database: &str, password: &str) -> DumpCommand {
        let port = connection.port.to_string();
        let args = match connection.engine {
            DatabaseEngine::MySql | DatabaseEngine::MariaDb => vec![
                "-h",
                &connection.host,
                "-P",
                &port,
                "-u",
                &connection.username,
                "--single-transaction",
                "--routines",
                "--triggers",
                database,
            ],
            DatabaseEngine::PostgreSql => vec![
                "-h",
                &connection.host,
                "-p",
                &port,
                "-U",
                &connection.username,
                "-d",
                database,
                "--no-password",
            ],
        };

        DumpCommand {
            program: connection.engine.dump_tool().to_string(),
            args: args.into_iter().map(str::to_string).collect(),
            env: password_env(connection.engine, password),
        }
    }
}
