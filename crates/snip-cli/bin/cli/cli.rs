use clap::{Parser, Subcommand, ValueEnum};
use snip_storage::{PipelineSettings, PostgresSettings, StorageConfig, DEFAULT_BASE_URL};
use snip_telemetry::LogFormat;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub const DATABASE_DSN_ENV: &str = "DATABASE_DSN";
pub const FILE_STORAGE_PATH_ENV: &str = "FILE_STORAGE_PATH";
pub const BASE_URL_ENV: &str = "BASE_URL";
pub const OWNER_ENV: &str = "SNIP_OWNER";
pub const LOG_FORMAT_ENV: &str = "SNIP_LOG_FORMAT";
pub const RESOLVER_WORKERS_ENV: &str = "SNIP_RESOLVER_WORKERS";
pub const DB_MAX_CONNECTIONS_ENV: &str = "SNIP_DB_MAX_CONNECTIONS";
pub const DB_TIMEOUT_MS_ENV: &str = "SNIP_DB_TIMEOUT_MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    #[value(name = "text")]
    Text,
    #[value(name = "json")]
    Json,
}

impl Display for LogFormatArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormatArg::Text => write!(f, "text"),
            LogFormatArg::Json => write!(f, "json"),
        }
    }
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "snip", about = "Shorten, resolve and delete links")]
pub struct CLI {
    /// Postgres connection string. Takes precedence over the file store.
    #[arg(short = 'd', long, env = DATABASE_DSN_ENV)]
    pub database_dsn: Option<String>,

    /// Path of the JSON document file used when no database is configured.
    #[arg(short = 'f', long, env = FILE_STORAGE_PATH_ENV)]
    pub file_storage_path: Option<PathBuf>,

    #[arg(short = 'b', long, env = BASE_URL_ENV, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Identity the command acts on behalf of. Empty means anonymous.
    #[arg(long, env = OWNER_ENV, default_value = "")]
    pub owner: String,

    #[arg(
        long,
        env = LOG_FORMAT_ENV,
        value_enum,
        default_value_t = LogFormatArg::Text
    )]
    pub log_format: LogFormatArg,

    #[arg(long, env = RESOLVER_WORKERS_ENV, default_value_t = 1)]
    pub resolver_workers: usize,

    #[arg(long, env = DB_MAX_CONNECTIONS_ENV, default_value_t = 10)]
    pub db_max_connections: u32,

    #[arg(long, env = DB_TIMEOUT_MS_ENV, default_value_t = 5000)]
    pub db_timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Shorten one URL and print its short link.
    Shorten { url: String },
    /// Shorten a JSON array of {"correlation_id", "original_url"} read from stdin.
    Batch,
    /// Print the URL behind a short code.
    Resolve { code: String },
    /// Print the owner's live links as JSON.
    List,
    /// Soft-delete the owner's links and wait for the outcome.
    Delete {
        #[arg(required = true)]
        codes: Vec<String>,
    },
    /// Check that the storage backend is reachable.
    Ping,
}

impl CLI {
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::builder()
            .database_dsn(self.database_dsn.clone())
            .file_storage_path(self.file_storage_path.clone())
            .base_url(self.base_url.as_str())
            .postgres(
                PostgresSettings::builder()
                    .max_connections(self.db_max_connections)
                    .operation_timeout(Duration::from_millis(self.db_timeout_ms))
                    .build(),
            )
            .pipeline(
                PipelineSettings::builder()
                    .resolver_workers(self.resolver_workers)
                    .build(),
            )
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snip_core::BackendKind;

    #[test]
    fn parses_global_flags_and_subcommand() {
        let cli = CLI::try_parse_from([
            "snip",
            "-f",
            "/tmp/urls.json",
            "--owner",
            "alice",
            "--resolver-workers",
            "4",
            "delete",
            "abc",
            "def",
        ])
        .unwrap();

        assert_eq!(cli.owner, "alice");
        assert!(matches!(cli.command, Command::Delete { ref codes } if codes.len() == 2));

        let config = cli.storage_config();
        assert_eq!(config.backend_kind(), BackendKind::File);
        assert_eq!(config.pipeline.resolver_workers, 4);
    }

    #[test]
    fn delete_requires_codes() {
        assert!(CLI::try_parse_from(["snip", "delete"]).is_err());
    }
}
