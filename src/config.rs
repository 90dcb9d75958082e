//! Process-environment-driven configuration, loaded once at startup via
//! `dotenvy` plus typed env reads — the same env-first idiom the original
//! bootstrap used for secrets and environment name, generalized here to
//! the server's own settings instead of a TOML file.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub database_path: PathBuf,
    pub default_webhook_timeout_secs: u64,
    pub secret_env_prefix: String,
    pub sentry_dsn: Option<String>,
    pub flows_dir: PathBuf,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let port = env_or("FLOWTIDE_PORT", "8081").parse().unwrap_or(8081);
        let environment = env_or("FLOWTIDE_ENV", "local");
        let database_path = PathBuf::from(env_or("FLOWTIDE_DB_PATH", "flowtide.sqlite3"));
        let default_webhook_timeout_secs =
            env_or("FLOWTIDE_WEBHOOK_TIMEOUT_SECS", "30").parse().unwrap_or(30);
        let secret_env_prefix = env_or("FLOWTIDE_SECRET_PREFIX", "FLOWTIDE_SECRET");
        let sentry_dsn = std::env::var("SENTRY_DSN").ok().filter(|d| !d.is_empty());
        let flows_dir = PathBuf::from(env_or("FLOWTIDE_FLOWS_DIR", "flows"));

        Self {
            port,
            environment,
            database_path,
            default_webhook_timeout_secs,
            secret_env_prefix,
            sentry_dsn,
            flows_dir,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
