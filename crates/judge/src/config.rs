//! Configuration for the judge service, loaded entirely from environment
//! variables.

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,

    /// PostgreSQL connection URL backing both the queue and the problem
    /// store.
    pub database_url: String,

    /// Directory holding instructor-supplied resources: arranged files,
    /// stdin/stdout/stderr fixtures, referenced relative to this root.
    pub resource_path: PathBuf,

    /// Directory holding student-uploaded files, referenced relative to
    /// this root.
    pub upload_dir_path: PathBuf,

    /// uid inside sandbox containers student/problem code runs as.
    pub guest_uid: String,
    /// gid inside sandbox containers student/problem code runs as.
    pub guest_gid: String,

    /// `--cgroup-parent` passed to every sandbox container, and the path
    /// segment the memory sampler reads back from `/sys-host/fs/cgroup`.
    pub cgroup_parent: String,

    /// Worker pool capacity: maximum submissions judged concurrently.
    pub worker_pool_capacity: usize,

    /// Service loop polling interval.
    pub service_tick_ms: u64,

    /// Bind address for the `/metrics` and `/health` side listener.
    pub metrics_bind_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL".to_string()))?,
            resource_path: PathBuf::from(
                env::var("RESOURCE_PATH").unwrap_or_else(|_| "/mnt/resources".to_string()),
            ),
            upload_dir_path: PathBuf::from(
                env::var("UPLOAD_DIR_PATH").unwrap_or_else(|_| "/mnt/uploads".to_string()),
            ),
            guest_uid: env::var("GUEST_UID").unwrap_or_else(|_| "1000".to_string()),
            guest_gid: env::var("GUEST_GID").unwrap_or_else(|_| "1000".to_string()),
            cgroup_parent: env::var("CGROUP_PARENT").unwrap_or_else(|_| "judge".to_string()),
            worker_pool_capacity: env::var("WORKER_POOL_CAPACITY")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("WORKER_POOL_CAPACITY".to_string()))?,
            service_tick_ms: env::var("SERVICE_TICK_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVICE_TICK_MS".to_string()))?,
            metrics_bind_addr: env::var("METRICS_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9090".to_string()),
        })
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}
