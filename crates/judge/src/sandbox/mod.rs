//! The sandbox capability group (C1): volumes, containers and one-shot
//! tasks, all backed by the host's container runtime.
//!
//! This module only defines the boundary. [`docker`] holds the real
//! implementation (shells out to the `docker` CLI, same as the rest of
//! this codebase talks to the runtime); [`fake`] holds an in-memory double
//! used to unit-test the judge pipeline without a Docker daemon.

pub mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;

use async_trait::async_trait;
use std::path::Path;

/// Opaque handle to a created Docker volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

/// Opaque handle to a created Docker container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

/// A volume mount entry for container/task creation.
#[derive(Debug, Clone)]
pub struct Mount {
    pub volume: VolumeId,
    /// Mount path inside the container.
    pub path: String,
    pub read_only: bool,
}

/// Parameters for creating a long-running container (used for the build
/// container and the run container).
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    /// The process the container runs; for a long-lived container this is
    /// typically an idle loop, with real work dispatched via `exec`.
    pub argv: Vec<String>,
    pub user: String,
    pub groups: Vec<String>,
    pub cpuset: Option<Vec<u32>>,
    pub mem_mb: u64,
    pub stack_kb: Option<u64>,
    pub pids_limit: Option<u32>,
    pub network: bool,
    pub work_dir: String,
    pub mounts: Vec<Mount>,
    pub cgroup_parent: String,
}

/// Result of `Container::exec`. Carries the same time/memory observations
/// as [`TaskResult`] — the Compile stage writes a `JudgeResult` with
/// "the observed timeMS/memoryKB/exit_code/stdout/stderr" just like Judge
/// testcases do, it just never compares stdout/stderr.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub time_ms: u64,
    pub memory_kb: u64,
}

/// Parameters for a one-shot [`Sandbox::run_task`] call.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub image: String,
    pub argv: Vec<String>,
    pub stdin: String,
    pub timeout_sec: f64,
    pub mem_mb: u64,
    pub stack_kb: Option<u64>,
    pub pids_limit: Option<u32>,
    pub mounts: Vec<Mount>,
    pub user: String,
    pub groups: Vec<String>,
    pub work_dir: String,
    pub cgroup_parent: String,
}

/// Result of a one-shot task: `{exitCode, stdout, stderr, timeMS,
/// memoryKB, TLE, MLE}` per the sandbox design.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub tle: bool,
    pub mle: bool,
}

/// The three capability groups exposed by C1. Every call returns
/// `anyhow::Result` — failures are surfaced with a textual reason, never
/// retried inside this layer.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn create_volume(&self) -> anyhow::Result<VolumeId>;
    async fn remove_volume(&self, id: &VolumeId) -> anyhow::Result<()>;
    /// Stage host paths into the volume root, preserving basenames.
    async fn copy_files_to_volume(&self, id: &VolumeId, host_paths: &[&Path]) -> anyhow::Result<()>;
    async fn clone_volume(&self, id: &VolumeId) -> anyhow::Result<VolumeId>;

    async fn create_container(&self, cfg: ContainerConfig) -> anyhow::Result<ContainerId>;
    async fn start_container(&self, id: &ContainerId) -> anyhow::Result<()>;
    async fn exec_in_container(
        &self,
        id: &ContainerId,
        argv: &[String],
        user: &str,
        work_dir: &str,
        timeout_sec: f64,
    ) -> anyhow::Result<ExecResult>;
    async fn copy_file_to_container(
        &self,
        id: &ContainerId,
        host_path: &Path,
        container_path: &str,
    ) -> anyhow::Result<()>;
    /// Best-effort; a container that cannot be removed is logged by the
    /// caller but never fails the judging result.
    async fn remove_container(&self, id: &ContainerId) -> anyhow::Result<()>;

    /// One-shot execution: create, start, monitor, tear down.
    async fn run_task(&self, spec: TaskSpec) -> anyhow::Result<TaskResult>;
}

/// 1 MiB, used for the MLE slack computation in both C1 and C4.
pub const MLE_SLACK_BYTES: u64 = 1024 * 1024;

/// `memoryKB*1024 + 1 MiB > memMB*1024*1024`
pub fn exceeds_memory(memory_kb: u64, mem_mb: u64) -> bool {
    memory_kb.saturating_mul(1024).saturating_add(MLE_SLACK_BYTES) > mem_mb.saturating_mul(1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mle_slack_boundary_matches_invariant_7() {
        let mem_mb = 256u64;
        let just_under = mem_mb * 1024 - 1024;
        let exact = mem_mb * 1024;
        assert!(!exceeds_memory(just_under, mem_mb));
        assert!(exceeds_memory(exact, mem_mb));
    }
}
