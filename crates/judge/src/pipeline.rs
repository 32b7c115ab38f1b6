//! Judge Pipeline (C4): drives one submission end-to-end through
//! `PreCheck -> Prepare -> Compile -> ArtifactCheck -> Judge -> Finalize`.
//!
//! Generic over `S: Sandbox` so the classification logic below can be unit
//! tested against [`crate::sandbox::fake::FakeSandbox`] without a Docker
//! daemon.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use gradecore::checker;
use gradecore::model::{JudgeResult, Problem, ProblemKey, Submission, SubmissionSummary, TestCase, TestCaseType};
use gradecore::verdict::{max_by_severity, severity};
use gradecore::{JudgeError, Verdict};

use crate::config::Config;
use crate::gateway::Gateway;
use crate::sandbox::{exceeds_memory, ContainerConfig, Mount, Sandbox, TaskSpec, VolumeId};

const BUILD_IMAGE: &str = "checker-lang-gcc";
const RUN_IMAGE: &str = "binary-runner";
const COMPILE_TIMEOUT_SEC: f64 = 2.0;
const COMPILE_MEM_MB: u64 = 512;
const WORK_DIR: &str = "/home/guest";

const MSG_MISSING_REQUIRED_FILE: &str = "ファイルが存在しません";
const MSG_BUILD_FAILED: &str = "ビルドに失敗しました";
const MSG_MISSING_ARTIFACT: &str = "実行ファイルが出力されていません";

pub struct Pipeline<S: Sandbox> {
    sandbox: Arc<S>,
    gateway: Arc<Gateway>,
    config: Arc<Config>,
}

/// Accumulates everything produced while judging one submission so
/// Finalize can compute the aggregate in one pass.
struct JudgeRun {
    submission: Submission,
    results: Vec<JudgeResult>,
}

impl JudgeRun {
    fn push(&mut self, result: JudgeResult) {
        self.submission.completed_task += 1;
        self.results.push(result);
    }
}

impl<S: Sandbox> Pipeline<S> {
    pub fn new(sandbox: Arc<S>, gateway: Arc<Gateway>, config: Arc<Config>) -> Self {
        Self {
            sandbox,
            gateway,
            config,
        }
    }

    /// Run a leased submission to completion. Never returns an error to the
    /// caller — every failure mode maps to a verdict and a written summary;
    /// the only thing logged-and-swallowed here is a failure to even write
    /// that summary (which the worker pool surfaces as a harvested error).
    pub async fn judge_one(&self, submission: Submission) -> anyhow::Result<()> {
        let mut run = JudgeRun {
            submission,
            results: Vec::new(),
        };

        let key = ProblemKey {
            lecture_id: run.submission.lecture_id,
            assignment_id: run.submission.assignment_id,
        };

        let problem = match self.gateway.fetch_problem(key).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                let err = JudgeError::ProblemMissing {
                    lecture_id: run.submission.lecture_id,
                    assignment_id: run.submission.assignment_id,
                };
                return self.finalize(run, None, Verdict::Ie, err.to_string(), String::new()).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "fetch_problem failed");
                let err = JudgeError::ProblemMissing {
                    lecture_id: run.submission.lecture_id,
                    assignment_id: run.submission.assignment_id,
                };
                return self.finalize(run, None, Verdict::Ie, err.to_string(), String::new()).await;
            }
        };

        if let Some(missing) = self.pre_check(&run.submission, &problem).await? {
            return self
                .finalize(
                    run,
                    Some(&problem),
                    Verdict::Fn_,
                    MSG_MISSING_REQUIRED_FILE.to_string(),
                    missing.join(" "),
                )
                .await;
        }

        let volume = match self.prepare(&run.submission, &problem).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "prepare failed");
                let err = JudgeError::SandboxSetup(e.to_string());
                return self.finalize(run, Some(&problem), Verdict::Ie, err.to_string(), String::new()).await;
            }
        };

        let container = match self
            .sandbox
            .create_container(ContainerConfig {
                image: BUILD_IMAGE.to_string(),
                argv: vec!["sleep".to_string(), "infinity".to_string()],
                user: format!("{}:{}", self.config.guest_uid, self.config.guest_gid),
                groups: vec![],
                cpuset: None,
                mem_mb: COMPILE_MEM_MB,
                stack_kb: None,
                pids_limit: Some(256),
                network: false,
                work_dir: WORK_DIR.to_string(),
                mounts: vec![Mount {
                    volume: volume.clone(),
                    path: WORK_DIR.to_string(),
                    read_only: false,
                }],
                cgroup_parent: self.config.cgroup_parent.clone(),
            })
            .await
        {
            Ok(c) => c,
            Err(e) => {
                let _ = self.sandbox.remove_volume(&volume).await;
                tracing::error!(error = %e, "build container create failed");
                let err = JudgeError::SandboxSetup(e.to_string());
                return self.finalize(run, Some(&problem), Verdict::Ie, err.to_string(), String::new()).await;
            }
        };

        if let Err(e) = self.sandbox.start_container(&container).await {
            let _ = self.sandbox.remove_container(&container).await;
            let _ = self.sandbox.remove_volume(&volume).await;
            tracing::error!(error = %e, "build container start failed");
            let err = JudgeError::SandboxSetup(e.to_string());
            return self.finalize(run, Some(&problem), Verdict::Ie, err.to_string(), String::new()).await;
        }

        if let Err(e) = self.compile(&mut run, &problem, &container).await {
            tracing::error!(error = %e, "compile stage errored");
            let _ = self.sandbox.remove_container(&container).await;
            let _ = self.sandbox.remove_volume(&volume).await;
            let err = JudgeError::SandboxExec(e.to_string());
            return self.finalize(run, Some(&problem), Verdict::Ie, err.to_string(), String::new()).await;
        }
        if run.results.iter().any(|r| !r.result.is_ac()) {
            self.persist_progress(&run).await;
            let _ = self.sandbox.remove_container(&container).await;
            let _ = self.sandbox.remove_volume(&volume).await;
            return self
                .finalize(run, Some(&problem), Verdict::Ce, MSG_BUILD_FAILED.to_string(), String::new())
                .await;
        }

        if let Some(missing) = self.artifact_check(&problem, &container).await? {
            let _ = self.sandbox.remove_container(&container).await;
            let _ = self.sandbox.remove_volume(&volume).await;
            return self
                .finalize(
                    run,
                    Some(&problem),
                    Verdict::Ce,
                    MSG_MISSING_ARTIFACT.to_string(),
                    missing.join(" "),
                )
                .await;
        }

        let _ = self.sandbox.remove_container(&container).await;

        let judge_outcome = self.judge(&mut run, &problem, &volume).await;

        let _ = self.sandbox.remove_volume(&volume).await;

        match judge_outcome {
            Ok(()) => self.finalize(run, Some(&problem), Verdict::Ac, String::new(), String::new()).await,
            Err(e) => {
                tracing::error!(error = %e, "judge phase runtime error");
                let err = JudgeError::SandboxExec(e.to_string());
                self.finalize(run, Some(&problem), Verdict::Ie, err.to_string(), String::new()).await
            }
        }
    }

    /// PreCheck: verify every required file was uploaded. Returns the
    /// sorted list of missing names when the check fails.
    async fn pre_check(&self, submission: &Submission, problem: &Problem) -> anyhow::Result<Option<Vec<String>>> {
        let uploaded = self.gateway.fetch_uploaded_files(submission.id).await?;
        let uploaded_basenames: HashSet<&str> = uploaded.iter().map(|f| f.basename()).collect();

        let missing: Vec<String> = problem
            .required_files
            .iter()
            .filter(|r| !uploaded_basenames.contains(r.name.as_str()))
            .map(|r| r.name.clone())
            .collect();

        if missing.is_empty() {
            Ok(None)
        } else {
            Ok(Some(missing))
        }
    }

    /// Prepare: create a working volume and stage uploaded + arranged files.
    async fn prepare(&self, submission: &Submission, problem: &Problem) -> anyhow::Result<VolumeId> {
        let volume = self.sandbox.create_volume().await?;

        let uploaded = self.gateway.fetch_uploaded_files(submission.id).await?;
        let host_paths: Vec<std::path::PathBuf> = uploaded
            .iter()
            .map(|f| self.config.upload_dir_path.join(&f.path))
            .chain(
                problem
                    .arranged_files
                    .iter()
                    .map(|f| self.config.resource_path.join(&f.path)),
            )
            .collect();
        let refs: Vec<&std::path::Path> = host_paths.iter().map(|p| p.as_path()).collect();

        self.sandbox.copy_files_to_volume(&volume, &refs).await?;
        Ok(volume)
    }

    /// Compile: run every `Built` testcase in order inside the build
    /// container. Stops recording further testcases is not needed — every
    /// `Built` testcase runs once, regardless of prior failures, matching
    /// the distilled spec's "for each Built testcase in definition order".
    async fn compile(
        &self,
        run: &mut JudgeRun,
        problem: &Problem,
        container: &crate::sandbox::ContainerId,
    ) -> anyhow::Result<()> {
        for tc in problem.built_testcases(run.submission.eval) {
            let argv = assemble_argv(tc);
            let exec = self
                .sandbox
                .exec_in_container(
                    container,
                    &argv,
                    &format!("{}:{}", self.config.guest_uid, self.config.guest_gid),
                    WORK_DIR,
                    COMPILE_TIMEOUT_SEC,
                )
                .await?;

            let verdict = if exec.exit_code != Some(0) {
                Verdict::Ce
            } else {
                Verdict::Ac
            };

            let result = JudgeResult::new(
                0,
                Utc::now(),
                run.submission.id,
                tc.id,
                verdict,
                tc.command.clone(),
                exec.time_ms,
                exec.memory_kb,
                exec.exit_code,
                &exec.stdout,
                &exec.stderr,
            );
            run.push(result);
            self.persist_progress(run).await;
        }
        Ok(())
    }

    /// ArtifactCheck: confirm every declared executable exists in the
    /// volume root. Returns the sorted list of missing names on failure.
    async fn artifact_check(
        &self,
        problem: &Problem,
        container: &crate::sandbox::ContainerId,
    ) -> anyhow::Result<Option<Vec<String>>> {
        let listing = self
            .sandbox
            .exec_in_container(
                container,
                &["ls".to_string(), "-p".to_string(), WORK_DIR.to_string()],
                &format!("{}:{}", self.config.guest_uid, self.config.guest_gid),
                WORK_DIR,
                COMPILE_TIMEOUT_SEC,
            )
            .await?;

        let present: HashSet<&str> = listing
            .stdout
            .lines()
            .filter(|l| !l.ends_with('/'))
            .collect();

        let missing: Vec<String> = problem
            .executables
            .iter()
            .filter(|e| !present.contains(e.name.as_str()))
            .map(|e| e.name.clone())
            .collect();

        if missing.is_empty() {
            Ok(None)
        } else {
            Ok(Some(missing))
        }
    }

    /// Judge: run every `Judge` testcase against the run container,
    /// classifying each outcome and appending a `JudgeResult`.
    async fn judge(&self, run: &mut JudgeRun, problem: &Problem, volume: &VolumeId) -> anyhow::Result<()> {
        for tc in problem.judge_testcases(run.submission.eval) {
            let argv = assemble_argv(tc);
            let stdin = self.read_resource(&tc.stdin_path).await.unwrap_or_default();
            let expected_stdout = self.read_resource(&tc.stdout_path).await;
            let expected_stderr = self.read_resource(&tc.stderr_path).await;
            let expected_terminate_normally = tc.exit_code == 0;

            let task = self
                .sandbox
                .run_task(TaskSpec {
                    image: RUN_IMAGE.to_string(),
                    argv: argv.clone(),
                    stdin,
                    timeout_sec: problem.time_ms as f64 / 1000.0,
                    mem_mb: problem.memory_mb,
                    stack_kb: None,
                    pids_limit: Some(256),
                    mounts: vec![Mount {
                        volume: volume.clone(),
                        path: WORK_DIR.to_string(),
                        read_only: false,
                    }],
                    user: format!("{}:{}", self.config.guest_uid, self.config.guest_gid),
                    groups: vec![],
                    work_dir: WORK_DIR.to_string(),
                    cgroup_parent: self.config.cgroup_parent.clone(),
                })
                .await?;

            let verdict = classify_judge_outcome(
                problem.time_ms,
                problem.memory_mb,
                task.tle,
                task.time_ms,
                task.memory_kb,
                task.exit_code,
                expected_terminate_normally,
                expected_stdout.as_deref(),
                &task.stdout,
                expected_stderr.as_deref(),
                &task.stderr,
            );

            let result = JudgeResult::new(
                0,
                Utc::now(),
                run.submission.id,
                tc.id,
                verdict,
                tc.command.clone(),
                task.time_ms,
                task.memory_kb,
                task.exit_code,
                &task.stdout,
                &task.stderr,
            );
            run.push(result);
            self.persist_progress(run).await;
        }
        Ok(())
    }

    async fn read_resource(&self, path: &Option<String>) -> Option<String> {
        let path = path.as_ref()?;
        tokio::fs::read_to_string(self.config.resource_path.join(path))
            .await
            .ok()
    }

    /// Persist the mutable progress triple after a testcase completes.
    /// `JudgeResult` rows are never written here — `finalize` bulk-inserts
    /// every accumulated result exactly once, at Finalize, matching
    /// `register_submission_summary_recursive`'s one-shot write; writing a
    /// result here too would double-insert it.
    async fn persist_progress(&self, run: &JudgeRun) {
        if let Err(e) = self.gateway.update_submission(&run.submission).await {
            tracing::error!(error = %e, "failed to persist submission progress");
        }
    }

    /// Finalize: aggregate severity, compute score, write everything
    /// atomically and mark the submission done. `pre_aggregate` seeds the
    /// fold for submission-level verdicts (`FN`/`IE`) that are not derived
    /// from any `JudgeResult` row.
    async fn finalize(
        &self,
        run: JudgeRun,
        problem: Option<&Problem>,
        pre_aggregate: Verdict,
        message: String,
        mut detail: String,
    ) -> anyhow::Result<()> {
        let JudgeRun {
            mut submission,
            results,
        } = run;

        let testcase_verdict = max_by_severity(results.iter().map(|r| r.result));
        let result = if severity(pre_aggregate) > severity(testcase_verdict) {
            pre_aggregate
        } else {
            testcase_verdict
        };

        let time_ms = results.iter().map(|r| r.time_ms).max().unwrap_or(0);
        let memory_kb = results.iter().map(|r| r.memory_kb).max().unwrap_or(0);

        // `problem` is `None` only on the IE-before-compile path (the
        // problem itself could not be loaded), where `results` is always
        // empty too — score/detail derivation from testcases is then moot.
        let score: i32 = problem
            .map(|p| {
                p.testcases
                    .iter()
                    .filter(|tc| {
                        results
                            .iter()
                            .any(|r| r.testcase_id == tc.id && r.result.is_ac())
                    })
                    .map(|tc| tc.score)
                    .sum()
            })
            .unwrap_or(0);

        for r in &results {
            if r.result.is_ac() {
                continue;
            }
            let testcase = problem.and_then(|p| p.testcases.iter().find(|tc| tc.id == r.testcase_id));
            let label = testcase
                .and_then(|tc| tc.message_on_fail.as_deref())
                .unwrap_or("testcase failed");
            let testcase_score = testcase.map(|tc| tc.score).unwrap_or(0);
            detail.push_str(&format!("{}: {} (-{})\n", label, r.result, testcase_score));
        }

        submission.progress = gradecore::model::Progress::Done;

        let summary = SubmissionSummary {
            submission_id: submission.id,
            batch_id: submission.batch_id,
            user_id: submission.user_id,
            result,
            message,
            detail,
            score,
            time_ms,
            memory_kb,
        };

        if let Err(e) = self.gateway.write_submission_summary(&submission, &summary, &results).await {
            tracing::error!(error = %e, submission_id = submission.id, "failed to write submission summary");
            crate::metrics::JOBS_FAILED.inc();
            return Err(e);
        }

        crate::metrics::record_verdict(result.code());
        let problem_label = format!("{}-{}", submission.lecture_id, submission.assignment_id);
        crate::metrics::record_execution(&problem_label, time_ms as f64 / 1000.0, memory_kb * 1024);
        crate::metrics::JOBS_PROCESSED.inc();
        Ok(())
    }
}

/// `argv = split(command) ++ split(args)`, ASCII-whitespace split with no
/// shell quoting, matching the original judge's `str.split()` semantics.
fn assemble_argv(tc: &TestCase) -> Vec<String> {
    let mut argv: Vec<String> = tc.command.split_whitespace().map(String::from).collect();
    if let Some(args) = &tc.args {
        argv.extend(args.split_whitespace().map(String::from));
    }
    argv
}

/// Classify one Judge-phase execution. First rule wins, matching the
/// distilled spec's ordered list exactly.
#[allow(clippy::too_many_arguments)]
fn classify_judge_outcome(
    problem_time_ms: u64,
    problem_memory_mb: u64,
    tle_flag: bool,
    observed_time_ms: u64,
    observed_memory_kb: u64,
    exit_code: Option<i32>,
    expected_terminate_normally: bool,
    expected_stdout: Option<&str>,
    actual_stdout: &str,
    expected_stderr: Option<&str>,
    actual_stderr: &str,
) -> Verdict {
    if tle_flag || observed_time_ms > problem_time_ms {
        return Verdict::Tle;
    }
    if exceeds_memory(observed_memory_kb, problem_memory_mb) {
        return Verdict::Mle;
    }
    if expected_terminate_normally && exit_code != Some(0) {
        return Verdict::Re;
    }
    if let Some(expected) = expected_stdout {
        if !checker::matches(expected, actual_stdout) {
            return Verdict::Wa;
        }
    }
    if let Some(expected) = expected_stderr {
        if !checker::matches(expected, actual_stderr) {
            return Verdict::Wa;
        }
    }
    if !expected_terminate_normally && exit_code == Some(0) {
        return Verdict::Wa;
    }
    Verdict::Ac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_argv_from_command_and_args_split_on_whitespace() {
        let tc = sample_testcase("./a.out  --flag", Some("1 2   3"));
        assert_eq!(
            assemble_argv(&tc),
            vec!["./a.out", "--flag", "1", "2", "3"]
        );
    }

    #[test]
    fn classifies_tle_before_everything_else() {
        let v = classify_judge_outcome(1000, 256, true, 2000, 10, Some(0), true, None, "", None, "");
        assert_eq!(v, Verdict::Tle);
    }

    #[test]
    fn classifies_tle_on_strict_overrun_not_exact_match() {
        assert_eq!(
            classify_judge_outcome(1000, 256, false, 1000, 10, Some(0), true, None, "", None, ""),
            Verdict::Ac
        );
        assert_eq!(
            classify_judge_outcome(1000, 256, false, 1001, 10, Some(0), true, None, "", None, ""),
            Verdict::Tle
        );
    }

    #[test]
    fn classifies_mle_with_one_mib_slack() {
        let v = classify_judge_outcome(1000, 256, false, 10, 256 * 1024, Some(0), true, None, "", None, "");
        assert_eq!(v, Verdict::Mle);
    }

    #[test]
    fn classifies_re_when_normal_termination_expected_but_nonzero_exit() {
        let v = classify_judge_outcome(1000, 256, false, 10, 10, Some(1), true, None, "", None, "");
        assert_eq!(v, Verdict::Re);
    }

    #[test]
    fn classifies_wa_on_stdout_mismatch() {
        let v = classify_judge_outcome(1000, 256, false, 10, 10, Some(0), true, Some("hi"), "bye", None, "");
        assert_eq!(v, Verdict::Wa);
    }

    #[test]
    fn classifies_wa_when_abnormal_termination_expected_but_exit_zero() {
        let v = classify_judge_outcome(1000, 256, false, 10, 10, Some(0), false, None, "", None, "");
        assert_eq!(v, Verdict::Wa);
    }

    #[test]
    fn classifies_ac_on_exact_match() {
        let v = classify_judge_outcome(1000, 256, false, 10, 10, Some(0), true, Some("hi"), "hi", None, "");
        assert_eq!(v, Verdict::Ac);
    }

    fn sample_testcase(command: &str, args: Option<&str>) -> TestCase {
        TestCase {
            id: 1,
            lecture_id: 1,
            assignment_id: 1,
            eval: false,
            kind: TestCaseType::Judge,
            score: 10,
            title: "t".to_string(),
            description: None,
            message_on_fail: None,
            command: command.to_string(),
            args: args.map(String::from),
            stdin_path: None,
            stdout_path: None,
            stderr_path: None,
            exit_code: 0,
        }
    }
}
