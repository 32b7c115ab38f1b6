//! In-memory [`Sandbox`] double used by pipeline unit tests. No Docker
//! daemon involved; scripted per test case via [`FakeSandbox::new`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ContainerConfig, ContainerId, ExecResult, Sandbox, TaskResult, TaskSpec, VolumeId};

/// What `exec_in_container` or `run_task` should hand back for a given
/// command, keyed by the whitespace-joined argv a caller asked to run.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub tle: bool,
    pub mle: bool,
}

pub struct FakeSandbox {
    scripts: HashMap<String, ScriptedOutcome>,
    default: ScriptedOutcome,
    next_id: Mutex<u64>,
    pub fail_copy_files: bool,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            default: ScriptedOutcome {
                exit_code: Some(0),
                ..Default::default()
            },
            next_id: Mutex::new(0),
            fail_copy_files: false,
        }
    }

    /// Script the outcome for a given argv (joined with spaces, matching
    /// the fully assembled command a testcase would actually run).
    pub fn script(mut self, argv: &[&str], outcome: ScriptedOutcome) -> Self {
        self.scripts.insert(argv.join(" "), outcome);
        self
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let mut n = self.next_id.lock().unwrap();
        *n += 1;
        format!("{prefix}-{n}")
    }

    fn outcome_for(&self, argv: &[String]) -> ScriptedOutcome {
        self.scripts
            .get(&argv.join(" "))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for FakeSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn create_volume(&self) -> anyhow::Result<VolumeId> {
        Ok(VolumeId(self.fresh_id("vol")))
    }

    async fn remove_volume(&self, _id: &VolumeId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn copy_files_to_volume(&self, _id: &VolumeId, _host_paths: &[&Path]) -> anyhow::Result<()> {
        if self.fail_copy_files {
            anyhow::bail!("scripted copy_files_to_volume failure");
        }
        Ok(())
    }

    async fn clone_volume(&self, _id: &VolumeId) -> anyhow::Result<VolumeId> {
        Ok(VolumeId(self.fresh_id("vol")))
    }

    async fn create_container(&self, _cfg: ContainerConfig) -> anyhow::Result<ContainerId> {
        Ok(ContainerId(self.fresh_id("container")))
    }

    async fn start_container(&self, _id: &ContainerId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn exec_in_container(
        &self,
        _id: &ContainerId,
        argv: &[String],
        _user: &str,
        _work_dir: &str,
        _timeout_sec: f64,
    ) -> anyhow::Result<ExecResult> {
        let o = self.outcome_for(argv);
        Ok(ExecResult {
            exit_code: o.exit_code,
            stdout: o.stdout,
            stderr: o.stderr,
            time_ms: o.time_ms,
            memory_kb: o.memory_kb,
        })
    }

    async fn copy_file_to_container(&self, _id: &ContainerId, _host_path: &Path, _container_path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove_container(&self, _id: &ContainerId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run_task(&self, spec: TaskSpec) -> anyhow::Result<TaskResult> {
        let o = self.outcome_for(&spec.argv);
        Ok(TaskResult {
            exit_code: o.exit_code,
            stdout: o.stdout,
            stderr: o.stderr,
            time_ms: o.time_ms,
            memory_kb: o.memory_kb,
            tle: o.tle,
            mle: o.mle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcome_is_returned_for_matching_argv() {
        let sandbox = FakeSandbox::new().script(
            &["echo", "hi"],
            ScriptedOutcome {
                exit_code: Some(0),
                stdout: "hi\n".to_string(),
                ..Default::default()
            },
        );
        let result = sandbox
            .run_task(TaskSpec {
                image: "binary-runner".into(),
                argv: vec!["echo".into(), "hi".into()],
                stdin: String::new(),
                timeout_sec: 1.0,
                mem_mb: 256,
                stack_kb: None,
                pids_limit: None,
                mounts: vec![],
                user: "guest".into(),
                groups: vec![],
                work_dir: "/home/guest".into(),
                cgroup_parent: "judge".into(),
            })
            .await
            .unwrap();
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn unscripted_argv_falls_back_to_default_success() {
        let sandbox = FakeSandbox::new();
        let result = sandbox
            .run_task(TaskSpec {
                image: "binary-runner".into(),
                argv: vec!["./a.out".into()],
                stdin: String::new(),
                timeout_sec: 1.0,
                mem_mb: 256,
                stack_kb: None,
                pids_limit: None,
                mounts: vec![],
                user: "guest".into(),
                groups: vec![],
                work_dir: "/home/guest".into(),
                cgroup_parent: "judge".into(),
            })
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
    }
}
