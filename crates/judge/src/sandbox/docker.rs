//! Docker-CLI-backed [`Sandbox`] implementation.
//!
//! Every operation shells out to the `docker` binary via
//! `tokio::process::Command`, the same way the rest of this codebase talks
//! to the container runtime — no `bollard`/Docker-API client here, just
//! argv construction and process spawning.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;

use super::{ContainerConfig, ContainerId, ExecResult, Mount, Sandbox, TaskResult, TaskSpec, VolumeId};

/// Image used to run tiny helper containers for volume file staging
/// (`docker cp` requires a container to exist, running or not).
const HELPER_IMAGE: &str = "binary-runner";

pub struct DockerSandbox {
    guest_uid: String,
    guest_gid: String,
    default_cgroup_parent: String,
}

impl DockerSandbox {
    pub fn new(guest_uid: impl Into<String>, guest_gid: impl Into<String>, cgroup_parent: impl Into<String>) -> Self {
        Self {
            guest_uid: guest_uid.into(),
            guest_gid: guest_gid.into(),
            default_cgroup_parent: cgroup_parent.into(),
        }
    }

    fn docker(&self) -> Command {
        Command::new("docker")
    }

    async fn run_capturing(&self, mut cmd: Command) -> Result<std::process::Output> {
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        cmd.output().await.context("failed to spawn docker")
    }
}

fn mount_args(mounts: &[Mount]) -> Vec<String> {
    let mut args = Vec::new();
    for m in mounts {
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:{}",
            m.volume.0,
            m.path,
            if m.read_only { "ro" } else { "rw" }
        ));
    }
    args
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn create_volume(&self) -> Result<VolumeId> {
        let name = format!("volume-{}", uuid_like());
        let out = self
            .run_capturing({
                let mut c = self.docker();
                c.args(["volume", "create", "--name", &name]);
                c
            })
            .await?;
        if !out.status.success() {
            bail!(
                "failed to create volume: {}",
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(VolumeId(name))
    }

    async fn remove_volume(&self, id: &VolumeId) -> Result<()> {
        let out = self
            .run_capturing({
                let mut c = self.docker();
                c.args(["volume", "rm", &id.0]);
                c
            })
            .await?;
        if !out.status.success() {
            bail!(
                "failed to remove volume {}: {}",
                id.0,
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(())
    }

    async fn copy_files_to_volume(&self, id: &VolumeId, host_paths: &[&Path]) -> Result<()> {
        let out = self
            .run_capturing({
                let mut c = self.docker();
                c.args([
                    "create",
                    "--user",
                    &format!("{}:{}", self.guest_uid, self.guest_gid),
                    "-w",
                    "/home/guest",
                    "-v",
                    &format!("{}:/home/guest", id.0),
                    HELPER_IMAGE,
                    "true",
                ]);
                c
            })
            .await?;
        if !out.status.success() {
            bail!(
                "failed to create staging container: {}",
                String::from_utf8_lossy(&out.stderr)
            );
        }
        let helper_id = String::from_utf8_lossy(&out.stdout).trim().to_string();

        let mut failure = None;
        for path in host_paths {
            let basename = path
                .file_name()
                .ok_or_else(|| anyhow!("host path has no basename: {}", path.display()))?;
            let dest = format!(
                "{}:/home/guest/{}",
                helper_id,
                basename.to_string_lossy()
            );
            let out = self
                .run_capturing({
                    let mut c = self.docker();
                    c.args(["cp", &path.to_string_lossy(), &dest]);
                    c
                })
                .await?;
            if !out.status.success() {
                failure = Some(anyhow!(
                    "failed to copy {} into volume {}: {}",
                    path.display(),
                    id.0,
                    String::from_utf8_lossy(&out.stderr)
                ));
                break;
            }
        }

        let _ = self
            .run_capturing({
                let mut c = self.docker();
                c.args(["rm", "-f", &helper_id]);
                c
            })
            .await;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn clone_volume(&self, id: &VolumeId) -> Result<VolumeId> {
        let new_volume = self.create_volume().await?;
        let out = self
            .run_capturing({
                let mut c = self.docker();
                c.args([
                    "run",
                    "--rm",
                    "--user",
                    "0:0",
                    "-v",
                    &format!("{}:/workdir/src", id.0),
                    "-v",
                    &format!("{}:/workdir/dst", new_volume.0),
                    "-w",
                    "/workdir",
                    HELPER_IMAGE,
                    "cp",
                    "-r",
                    "/workdir/src/.",
                    "/workdir/dst",
                ]);
                c
            })
            .await?;
        if !out.status.success() {
            let _ = self.remove_volume(&new_volume).await;
            bail!(
                "failed to clone volume {}: {}",
                id.0,
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(new_volume)
    }

    async fn create_container(&self, cfg: ContainerConfig) -> Result<ContainerId> {
        let mut args: Vec<String> = vec!["create".into()];
        args.push(format!("--cgroup-parent={}", cfg.cgroup_parent));
        args.push(format!("--user={}", cfg.user));
        for g in &cfg.groups {
            args.push("--group-add".into());
            args.push(g.clone());
        }
        if let Some(cpuset) = &cfg.cpuset {
            args.push(format!(
                "--cpuset-cpus={}",
                cpuset
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }
        args.push(format!("--memory={}m", cfg.mem_mb));
        args.push(format!("--memory-swap={}m", cfg.mem_mb));
        if let Some(stack_kb) = cfg.stack_kb {
            args.push(format!("--ulimit=stack={}:{}", stack_kb * 1024, stack_kb * 1024));
        }
        if let Some(pids) = cfg.pids_limit {
            args.push(format!("--pids-limit={}", pids));
        }
        if !cfg.network {
            args.push("--network=none".into());
        }
        args.push("-w".into());
        args.push(cfg.work_dir.clone());
        args.extend(mount_args(&cfg.mounts));
        args.push(cfg.image.clone());
        args.extend(cfg.argv.clone());

        let out = self
            .run_capturing({
                let mut c = self.docker();
                c.args(&args);
                c
            })
            .await?;
        if !out.status.success() {
            bail!(
                "failed to create container: {}",
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(ContainerId(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        let out = self
            .run_capturing({
                let mut c = self.docker();
                c.args(["start", &id.0]);
                c
            })
            .await?;
        if !out.status.success() {
            bail!(
                "failed to start container {}: {}",
                id.0,
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(())
    }

    async fn exec_in_container(
        &self,
        id: &ContainerId,
        argv: &[String],
        user: &str,
        work_dir: &str,
        timeout_sec: f64,
    ) -> Result<ExecResult> {
        let mut cmd = self.docker();
        cmd.args(["exec", "-u", user, "-w", work_dir, &id.0]);
        cmd.args(argv);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let sampler = MemorySampler::start(id, &self.default_cgroup_parent);
        let start = Instant::now();

        let child = cmd.spawn().context("failed to spawn docker exec")?;
        let wait = tokio::time::timeout(
            Duration::from_secs_f64(timeout_sec + 0.5),
            child.wait_with_output(),
        )
        .await;

        let elapsed = start.elapsed();
        let peak_kb = sampler.stop().await;

        match wait {
            Ok(Ok(out)) => Ok(ExecResult {
                exit_code: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                time_ms: elapsed.as_millis() as u64,
                memory_kb: peak_kb,
            }),
            Ok(Err(e)) => Err(anyhow!("docker exec failed: {}", e)),
            Err(_) => bail!("docker exec timed out after {}s", timeout_sec),
        }
    }

    async fn copy_file_to_container(&self, id: &ContainerId, host_path: &Path, container_path: &str) -> Result<()> {
        let dest = format!("{}:{}", id.0, container_path);
        let out = self
            .run_capturing({
                let mut c = self.docker();
                c.args(["cp", &host_path.to_string_lossy(), &dest]);
                c
            })
            .await?;
        if !out.status.success() {
            bail!(
                "failed to copy {} into container {}: {}",
                host_path.display(),
                id.0,
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        let out = self
            .run_capturing({
                let mut c = self.docker();
                c.args(["rm", "-f", &id.0]);
                c
            })
            .await?;
        if !out.status.success() {
            bail!(
                "failed to remove container {}: {}",
                id.0,
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(())
    }

    async fn run_task(&self, spec: TaskSpec) -> Result<TaskResult> {
        let container_id = self
            .create_container(ContainerConfig {
                image: spec.image.clone(),
                argv: spec.argv.clone(),
                user: spec.user.clone(),
                groups: spec.groups.clone(),
                cpuset: None,
                mem_mb: spec.mem_mb,
                stack_kb: spec.stack_kb,
                pids_limit: spec.pids_limit,
                network: false,
                work_dir: spec.work_dir.clone(),
                mounts: spec.mounts.clone(),
                cgroup_parent: spec.cgroup_parent.clone(),
            })
            .await
            .context("sandbox setup failed")?;

        let sampler = MemorySampler::start(&container_id, &spec.cgroup_parent);

        let timeout_dur = Duration::from_secs_f64(if spec.timeout_sec > 0.0 {
            spec.timeout_sec + 0.5
        } else {
            30.5
        });

        let start = Instant::now();
        let run_result = self.start_with_stdin(&container_id, &spec.stdin, timeout_dur).await;
        let elapsed = start.elapsed();

        let peak_kb = sampler.stop().await;

        let result = match run_result {
            Ok(outcome) => TaskResult {
                exit_code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                time_ms: elapsed.as_millis() as u64,
                memory_kb: peak_kb,
                tle: outcome.killed_for_timeout
                    || (spec.timeout_sec > 0.0 && spec.timeout_sec < elapsed.as_secs_f64()),
                mle: super::exceeds_memory(peak_kb, spec.mem_mb),
            },
            Err(e) => {
                let _ = self.remove_container(&container_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.remove_container(&container_id).await {
            tracing::warn!(container = %container_id.0, error = %e, "failed to remove task container");
        }

        Ok(result)
    }
}

struct StartOutcome {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    killed_for_timeout: bool,
}

impl DockerSandbox {
    async fn start_with_stdin(
        &self,
        id: &ContainerId,
        stdin: &str,
        timeout_dur: Duration,
    ) -> Result<StartOutcome> {
        let mut cmd = self.docker();
        cmd.args(["start", "-a", "-i", &id.0]);
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().context("failed to spawn docker start")?;
        if let Some(mut stdin_pipe) = child.stdin.take() {
            let input = stdin.as_bytes().to_vec();
            stdin_pipe
                .write_all(&input)
                .await
                .context("failed to write stdin to container")?;
        }

        match tokio::time::timeout(timeout_dur, child.wait_with_output()).await {
            Ok(Ok(out)) => Ok(StartOutcome {
                exit_code: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                killed_for_timeout: false,
            }),
            Ok(Err(e)) => Err(anyhow!("docker start failed: {}", e)),
            Err(_) => {
                let _ = self
                    .run_capturing({
                        let mut c = self.docker();
                        c.args(["kill", &id.0]);
                        c
                    })
                    .await;
                let exit = self
                    .run_capturing({
                        let mut c = self.docker();
                        c.args(["inspect", "--format={{.State.ExitCode}}", &id.0]);
                        c
                    })
                    .await
                    .ok();
                let exit_code = exit
                    .and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse::<i32>().ok());
                Ok(StartOutcome {
                    exit_code,
                    stdout: String::new(),
                    stderr: String::new(),
                    killed_for_timeout: true,
                })
            }
        }
    }
}

/// Concurrent peak-memory sampler: polls the container's cgroup
/// `memory.current` at ~1ms cadence, falling back to `docker stats` if the
/// cgroup path cannot be opened. Guaranteed to stop via [`Self::stop`],
/// called on every exit path of `run_task` above (success or error).
struct MemorySampler {
    peak_bytes: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MemorySampler {
    fn start(container_id: &ContainerId, cgroup_parent: &str) -> Self {
        let peak_bytes = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let cgroup_path = std::path::PathBuf::from("/sys-host/fs/cgroup")
            .join(cgroup_parent)
            .join(format!("docker-{}.scope", container_id.0))
            .join("memory.current");

        let peak_clone = peak_bytes.clone();
        let running_clone = running.clone();
        let container_id = container_id.0.clone();

        let handle = tokio::spawn(async move {
            let use_cgroup = tokio::fs::metadata(&cgroup_path).await.is_ok();
            while running_clone.load(Ordering::Relaxed) {
                if use_cgroup {
                    if let Ok(contents) = tokio::fs::read_to_string(&cgroup_path).await {
                        if let Ok(v) = contents.trim().parse::<u64>() {
                            peak_clone.fetch_max(v, Ordering::Relaxed);
                        }
                    }
                } else if let Ok(out) = Command::new("docker")
                    .args(["stats", "--no-stream", "--format", "{{.MemUsage}}", &container_id])
                    .stdin(std::process::Stdio::null())
                    .output()
                    .await
                {
                    if let Some(bytes) = parse_docker_stats_mem_usage(&String::from_utf8_lossy(&out.stdout)) {
                        peak_clone.fetch_max(bytes, Ordering::Relaxed);
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        Self {
            peak_bytes,
            running,
            handle: Some(handle),
        }
    }

    /// Stop the sampler and return the observed peak, in KB.
    async fn stop(mut self) -> u64 {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.await;
        }
        self.peak_bytes.load(Ordering::Relaxed) / 1024
    }
}

fn parse_docker_stats_mem_usage(s: &str) -> Option<u64> {
    // "1.23GiB / 2.00GiB" -> first component is the used amount.
    let used = s.split('/').next()?.trim();
    let (value, unit) = used.split_at(used.find(|c: char| c.is_alphabetic())?);
    let value: f64 = value.trim().parse().ok()?;
    let bytes = match unit.trim() {
        "B" => value,
        "KiB" => value * 1024.0,
        "MiB" => value * 1024.0 * 1024.0,
        "GiB" => value * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(bytes as u64)
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut buf = Vec::new();
    let _ = write!(buf, "{:x}-{:x}", nanos, std::process::id());
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_stats_mem_usage() {
        assert_eq!(
            parse_docker_stats_mem_usage("123.45MiB / 512MiB"),
            Some((123.45 * 1024.0 * 1024.0) as u64)
        );
        assert_eq!(parse_docker_stats_mem_usage("garbage"), None);
    }
}
