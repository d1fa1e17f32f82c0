//! Typed `Settings`, loaded from environment variables with the fixed
//! prefix `BUILD_PUBLISHER_`.
//!
//! # Example
//!
//! ```
//! use gbp_config::Settings;
//!
//! std::env::set_var("BUILD_PUBLISHER_JENKINS_BASE_URL", "https://ci.example.com");
//! std::env::set_var("BUILD_PUBLISHER_STORAGE_PATH", "/tmp/gbp");
//! std::env::set_var("BUILD_PUBLISHER_RECORDS_BACKEND", "memory");
//! std::env::set_var("BUILD_PUBLISHER_WORKER_BACKEND", "sync");
//!
//! let settings = Settings::from_env().expect("load settings");
//! assert_eq!(settings.records_backend, gbp_config::RecordsBackend::Memory);
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Env var prefix every key in this crate is read under.
pub const ENV_PREFIX: &str = "BUILD_PUBLISHER_";

const DEFAULT_ARTIFACT_NAME: &str = "build.tar.gz";
const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_API_KEY_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordsBackend {
    Memory,
    Sql,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerBackend {
    Sync,
    Thread,
    /// Any other value names an external queue backend (e.g. `"rq"`).
    Queue(String),
}

/// Process configuration, assembled once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub jenkins_base_url: String,
    pub jenkins_user: Option<String>,
    pub jenkins_api_key: Option<String>,
    pub jenkins_artifact_name: String,
    pub jenkins_download_chunk_size: usize,

    pub storage_path: PathBuf,
    pub records_backend: RecordsBackend,
    /// Connection string for [`RecordsBackend::Sql`]; unused otherwise.
    /// Defaults to a SQLite file named `records.sqlite3` under
    /// `storage_path` so a minimal setup needs no extra configuration.
    pub database_url: String,
    pub worker_backend: WorkerBackend,
    pub enable_purge: bool,

    pub api_key_enable: bool,
    pub api_key_key: Option<Vec<u8>>,
    pub api_key_length: usize,
}

impl Settings {
    /// Load settings from the process environment. Fails if a required key
    /// is missing or a value can't be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_source(&RealEnv)
    }

    /// Load settings from any [`EnvSource`] (used in tests to avoid mutating
    /// the real process environment).
    pub fn from_source(env: &dyn EnvSource) -> Result<Self> {
        let jenkins_user = env.get("JENKINS_USER");
        let jenkins_api_key = env.get("JENKINS_API_KEY");
        if jenkins_user.is_some() != jenkins_api_key.is_some() {
            bail!("JENKINS_USER and JENKINS_API_KEY must be set together or not at all");
        }

        let api_key_enable = match env.get("API_KEY_ENABLE") {
            Some(v) => get_bool(&v).context("BUILD_PUBLISHER_API_KEY_ENABLE")?,
            None => false,
        };
        let api_key_key = match env.get("API_KEY_KEY") {
            Some(v) => Some(
                BASE64
                    .decode(&v)
                    .context("BUILD_PUBLISHER_API_KEY_KEY is not valid base64")?,
            ),
            None => None,
        };
        if api_key_enable && api_key_key.is_none() {
            bail!("API_KEY_ENABLE is true but API_KEY_KEY is not set");
        }

        let storage_path = PathBuf::from(
            env.require("STORAGE_PATH")
                .context("BUILD_PUBLISHER_STORAGE_PATH is required")?,
        );

        Ok(Self {
            jenkins_base_url: env
                .require("JENKINS_BASE_URL")
                .context("BUILD_PUBLISHER_JENKINS_BASE_URL is required")?,
            jenkins_user,
            jenkins_api_key,
            jenkins_artifact_name: env
                .get("JENKINS_ARTIFACT_NAME")
                .unwrap_or_else(|| DEFAULT_ARTIFACT_NAME.to_string()),
            jenkins_download_chunk_size: match env.get("JENKINS_DOWNLOAD_CHUNK_SIZE") {
                Some(v) => v
                    .parse()
                    .context("BUILD_PUBLISHER_JENKINS_DOWNLOAD_CHUNK_SIZE must be an integer")?,
                None => DEFAULT_CHUNK_SIZE,
            },

            storage_path: storage_path.clone(),
            records_backend: parse_records_backend(
                &env.require("RECORDS_BACKEND")
                    .context("BUILD_PUBLISHER_RECORDS_BACKEND is required")?,
            )?,
            database_url: env.get("DATABASE_URL").unwrap_or_else(|| {
                format!("sqlite://{}/records.sqlite3", storage_path.display())
            }),
            worker_backend: parse_worker_backend(
                &env.require("WORKER_BACKEND")
                    .context("BUILD_PUBLISHER_WORKER_BACKEND is required")?,
            ),
            enable_purge: match env.get("ENABLE_PURGE") {
                Some(v) => get_bool(&v).context("BUILD_PUBLISHER_ENABLE_PURGE")?,
                None => false,
            },

            api_key_enable,
            api_key_key,
            api_key_length: match env.get("API_KEY_LENGTH") {
                Some(v) => v
                    .parse()
                    .context("BUILD_PUBLISHER_API_KEY_LENGTH must be an integer")?,
                None => DEFAULT_API_KEY_LENGTH,
            },
        })
    }
}

fn parse_records_backend(s: &str) -> Result<RecordsBackend> {
    match s {
        "memory" => Ok(RecordsBackend::Memory),
        "sql" => Ok(RecordsBackend::Sql),
        other => bail!("unknown RECORDS_BACKEND: {other:?}"),
    }
}

fn parse_worker_backend(s: &str) -> WorkerBackend {
    match s {
        "sync" => WorkerBackend::Sync,
        "thread" => WorkerBackend::Thread,
        other => WorkerBackend::Queue(other.to_string()),
    }
}

/// Parse GBP's boolean vocabulary: `{0,f,false,n,no,off}` vs.
/// `{1,t,true,y,yes,on}`, case-insensitive.
pub fn get_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "n" | "no" | "off" => Ok(false),
        other => bail!("not a recognized boolean: {other:?}"),
    }
}

/// Source of env-var lookups, abstracted so tests can supply a fake
/// environment instead of mutating the real process environment.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .with_context(|| format!("{ENV_PREFIX}{key} is not set"))
    }
}

/// The real process environment, reading `BUILD_PUBLISHER_<key>`.
pub struct RealEnv;

impl EnvSource for RealEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("{ENV_PREFIX}{key}")).ok()
    }
}
