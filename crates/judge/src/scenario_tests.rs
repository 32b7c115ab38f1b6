//! End-to-end judging scenarios (S1-S6 from the component design), run
//! against a real Postgres instance and a [`crate::sandbox::fake::FakeSandbox`]
//! so no Docker daemon is required. Gated behind `db-tests`/`TEST_DATABASE_URL`
//! the same way `gateway::db_tests` is — written, not exercised, by this
//! exercise.

#![cfg(all(test, feature = "db-tests"))]

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::pipeline::Pipeline;
use crate::sandbox::fake::{FakeSandbox, ScriptedOutcome};

async fn test_pool() -> PgPool {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for db-tests");
    PgPool::connect(&url).await.expect("connect to test database")
}

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        environment: "test".to_string(),
        database_url: String::new(),
        resource_path: std::env::temp_dir().join("judge-scenario-resources"),
        upload_dir_path: std::env::temp_dir().join("judge-scenario-uploads"),
        guest_uid: "1000".to_string(),
        guest_gid: "1000".to_string(),
        cgroup_parent: "judge-test".to_string(),
        worker_pool_capacity: 1,
        service_tick_ms: 5000,
        metrics_bind_addr: "127.0.0.1:0".to_string(),
    })
}

/// Insert a problem header + testcases for `(lecture_id, assignment_id)`,
/// wiping any rows left behind by a prior run of the same scenario.
struct ScenarioProblem {
    lecture_id: i64,
    assignment_id: i64,
}

impl ScenarioProblem {
    async fn reset(pool: &PgPool, lecture_id: i64, assignment_id: i64) -> Self {
        for table in [
            "judge_results",
            "submission_summaries",
            "uploaded_files",
            "submissions",
            "testcases",
            "required_files",
            "arranged_files",
            "executables",
            "problems",
        ] {
            let _ = sqlx::query(&format!(
                "DELETE FROM {table} WHERE lecture_id = $1 AND assignment_id = $2"
            ))
            .bind(lecture_id)
            .bind(assignment_id)
            .execute(pool)
            .await;
        }
        sqlx::query("INSERT INTO problems (lecture_id, assignment_id, time_ms, memory_mb) VALUES ($1, $2, 1000, 256)")
            .bind(lecture_id)
            .bind(assignment_id)
            .execute(pool)
            .await
            .expect("insert problem header");
        Self {
            lecture_id,
            assignment_id,
        }
    }

    async fn require_file(&self, pool: &PgPool, name: &str) {
        sqlx::query("INSERT INTO required_files (lecture_id, assignment_id, name) VALUES ($1, $2, $3)")
            .bind(self.lecture_id)
            .bind(self.assignment_id)
            .bind(name)
            .execute(pool)
            .await
            .expect("insert required file");
    }

    async fn executable(&self, pool: &PgPool, name: &str) {
        sqlx::query("INSERT INTO executables (lecture_id, assignment_id, name) VALUES ($1, $2, $3)")
            .bind(self.lecture_id)
            .bind(self.assignment_id)
            .bind(name)
            .execute(pool)
            .await
            .expect("insert executable");
    }

    #[allow(clippy::too_many_arguments)]
    async fn testcase(
        &self,
        pool: &PgPool,
        kind: &str,
        score: i32,
        command: &str,
        exit_code: i32,
        message_on_fail: Option<&str>,
    ) -> i64 {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO testcases
                (lecture_id, assignment_id, eval, kind, score, title, message_on_fail, command, exit_code)
            VALUES ($1, $2, false, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(self.lecture_id)
        .bind(self.assignment_id)
        .bind(kind)
        .bind(score)
        .bind(format!("{kind} testcase"))
        .bind(message_on_fail)
        .bind(command)
        .bind(exit_code)
        .fetch_one(pool)
        .await
        .expect("insert testcase");
        id
    }

    /// Like [`Self::testcase`] but also sets `stdout_path`, for scenarios
    /// that need an actual output comparison instead of an exit-code-only
    /// check.
    #[allow(clippy::too_many_arguments)]
    async fn judge_testcase_with_stdout(
        &self,
        pool: &PgPool,
        score: i32,
        command: &str,
        exit_code: i32,
        message_on_fail: &str,
        stdout_path: &str,
    ) -> i64 {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO testcases
                (lecture_id, assignment_id, eval, kind, score, title, message_on_fail, command, exit_code, stdout_path)
            VALUES ($1, $2, false, 'judge', $3, 'judge testcase', $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(self.lecture_id)
        .bind(self.assignment_id)
        .bind(score)
        .bind(message_on_fail)
        .bind(command)
        .bind(exit_code)
        .bind(stdout_path)
        .fetch_one(pool)
        .await
        .expect("insert judge testcase with stdout_path");
        id
    }

    async fn submit(&self, pool: &PgPool, eval: bool) -> i64 {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO submissions
                (ts, user_id, lecture_id, assignment_id, eval, progress, total_task, completed_task)
            VALUES (now(), 1, $1, $2, $3, 'queued', 0, 0)
            RETURNING id
            "#,
        )
        .bind(self.lecture_id)
        .bind(self.assignment_id)
        .bind(eval)
        .fetch_one(pool)
        .await
        .expect("insert submission");
        id
    }
}

/// Lease exactly one already-known submission by id, bypassing
/// `Gateway::lease_queued`'s `LIMIT n` scan so concurrently running
/// scenario tests never race over each other's queued rows.
async fn lease_one(pool: &PgPool, submission_id: i64) -> gradecore::model::Submission {
    use gradecore::model::Progress;

    let (lecture_id, assignment_id, eval): (i64, i64, bool) = sqlx::query_as(
        "SELECT lecture_id, assignment_id, eval FROM submissions WHERE id = $1",
    )
    .bind(submission_id)
    .fetch_one(pool)
    .await
    .expect("fetch submission header");

    let (total_task,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM testcases WHERE lecture_id = $1 AND assignment_id = $2 AND (eval = $3 OR eval = false)",
    )
    .bind(lecture_id)
    .bind(assignment_id)
    .bind(eval)
    .fetch_one(pool)
    .await
    .expect("count testcases");

    sqlx::query("UPDATE submissions SET progress = 'running', total_task = $2, completed_task = 0 WHERE id = $1")
        .bind(submission_id)
        .bind(total_task as i32)
        .execute(pool)
        .await
        .expect("flip submission to running");

    gradecore::model::Submission {
        id: submission_id,
        ts: chrono::Utc::now(),
        batch_id: None,
        user_id: 1,
        lecture_id,
        assignment_id,
        eval,
        progress: Progress::Running,
        total_task: total_task as i32,
        completed_task: 0,
    }
}

async fn upload_file(pool: &PgPool, submission_id: i64, path: &str) {
    sqlx::query("INSERT INTO uploaded_files (submission_id, path) VALUES ($1, $2)")
        .bind(submission_id)
        .bind(path)
        .execute(pool)
        .await
        .expect("insert uploaded file");
}

async fn fetch_summary(pool: &PgPool, submission_id: i64) -> (String, String, String, i32) {
    sqlx::query_as(
        "SELECT result, message, detail, score FROM submission_summaries WHERE submission_id = $1",
    )
    .bind(submission_id)
    .fetch_one(pool)
    .await
    .expect("fetch submission summary")
}

/// S1 — missing required file: expect FN, no JudgeResult rows.
#[tokio::test]
async fn s1_missing_required_file_yields_fn() {
    let pool = test_pool().await;
    let problem = ScenarioProblem::reset(&pool, 9001, 1).await;
    problem.require_file(&pool, "main.c").await;

    let gateway = Arc::new(Gateway::new(pool.clone()));

    let submission_id = problem.submit(&pool, false).await;
    upload_file(&pool, submission_id, "other.c").await;

    let submission = lease_one(&pool, submission_id).await;

    let sandbox = Arc::new(FakeSandbox::new());
    let pipeline = Pipeline::new(sandbox, gateway.clone(), test_config());
    pipeline.judge_one(submission).await.expect("judge_one");

    let (result, message, detail, score) = fetch_summary(&pool, submission_id).await;
    assert_eq!(result, "FN");
    assert_eq!(message, "ファイルが存在しません");
    assert_eq!(detail, "main.c");
    assert_eq!(score, 0);

    let result_rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM judge_results WHERE submission_id = $1")
        .bind(submission_id)
        .fetch_one(&pool)
        .await
        .expect("count judge results");
    assert_eq!(result_rows.0, 0);
}

/// S2 — compile failure: one CE JudgeResult, Judge phase never runs.
#[tokio::test]
async fn s2_compile_failure_yields_ce_and_skips_judge() {
    let pool = test_pool().await;
    let problem = ScenarioProblem::reset(&pool, 9001, 2).await;
    problem.testcase(&pool, "built", 0, "make", 0, None).await;
    problem
        .testcase(&pool, "judge", 50, "./a.out", 0, Some("wrong answer"))
        .await;

    let submission_id = problem.submit(&pool, false).await;

    let gateway = Arc::new(Gateway::new(pool.clone()));
    let submission = lease_one(&pool, submission_id).await;

    let sandbox = Arc::new(FakeSandbox::new().script(
        &["make"],
        ScriptedOutcome {
            exit_code: Some(2),
            stderr: "syntax error".to_string(),
            ..Default::default()
        },
    ));
    let pipeline = Pipeline::new(sandbox, gateway.clone(), test_config());
    pipeline.judge_one(submission).await.expect("judge_one");

    let (result, message, _detail, score) = fetch_summary(&pool, submission_id).await;
    assert_eq!(result, "CE");
    assert!(message.contains("ビルドに失敗しました"));
    assert_eq!(score, 0);

    let rows: Vec<(String, Option<i32>)> = sqlx::query_as(
        "SELECT result, exit_code FROM judge_results WHERE submission_id = $1",
    )
    .bind(submission_id)
    .fetch_all(&pool)
    .await
    .expect("fetch judge results");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0], ("CE".to_string(), Some(2)));
}

/// S4 — clean AC: one Built + two Judge testcases, all AC, score sums.
#[tokio::test]
async fn s4_clean_run_sums_score_and_takes_worst_time_and_memory() {
    let pool = test_pool().await;
    let problem = ScenarioProblem::reset(&pool, 9001, 4).await;
    problem.testcase(&pool, "built", 0, "make", 0, None).await;
    problem
        .testcase(&pool, "judge", 50, "./a.out", 0, Some("case 1 failed"))
        .await;
    problem
        .testcase(&pool, "judge", 50, "./a.out", 0, Some("case 2 failed"))
        .await;

    let submission_id = problem.submit(&pool, false).await;

    let gateway = Arc::new(Gateway::new(pool.clone()));
    let submission = lease_one(&pool, submission_id).await;

    let sandbox = Arc::new(FakeSandbox::new().script(
        &["./a.out"],
        ScriptedOutcome {
            exit_code: Some(0),
            time_ms: 120,
            memory_kb: 2048,
            ..Default::default()
        },
    ));
    let pipeline = Pipeline::new(sandbox, gateway.clone(), test_config());
    pipeline.judge_one(submission).await.expect("judge_one");

    let (result, _message, _detail, score) = fetch_summary(&pool, submission_id).await;
    assert_eq!(result, "AC");
    assert_eq!(score, 100);

    let rows: Vec<(String,)> = sqlx::query_as("SELECT result FROM judge_results WHERE submission_id = $1")
        .bind(submission_id)
        .fetch_all(&pool)
        .await
        .expect("fetch judge results");
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|(r,)| r == "AC"));
}

/// S3 — missing artifact: compile succeeds but the declared executable
/// never lands in the volume root, so ArtifactCheck fails the submission
/// before Judge ever runs.
#[tokio::test]
async fn s3_missing_artifact_yields_ce_with_missing_name_in_detail() {
    let pool = test_pool().await;
    let problem = ScenarioProblem::reset(&pool, 9001, 3).await;
    problem.executable(&pool, "main").await;
    problem.testcase(&pool, "built", 0, "make", 0, None).await;

    let submission_id = problem.submit(&pool, false).await;

    let gateway = Arc::new(Gateway::new(pool.clone()));
    let submission = lease_one(&pool, submission_id).await;

    let sandbox = Arc::new(FakeSandbox::new().script(
        &["ls", "-p", "/home/guest"],
        ScriptedOutcome {
            exit_code: Some(0),
            stdout: "main.o\n".to_string(),
            ..Default::default()
        },
    ));
    let pipeline = Pipeline::new(sandbox, gateway.clone(), test_config());
    pipeline.judge_one(submission).await.expect("judge_one");

    let (result, _message, detail, score) = fetch_summary(&pool, submission_id).await;
    assert_eq!(result, "CE");
    assert_eq!(detail, "main");
    assert_eq!(score, 0);

    // The Built testcase itself compiled fine (AC) and is part of `results`,
    // so Finalize's bulk write still inserts that one row even though the
    // submission as a whole fails at ArtifactCheck.
    let rows: Vec<(String,)> = sqlx::query_as("SELECT result FROM judge_results WHERE submission_id = $1")
        .bind(submission_id)
        .fetch_all(&pool)
        .await
        .expect("fetch judge results");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "AC");
}

/// S5 — TLE outranks WA: first testcase times out, second runs in time but
/// produces the wrong output. Submission-level verdict is the more severe
/// of the two (TLE), and both failures are listed in the detail.
#[tokio::test]
async fn s5_tle_outranks_wa_and_both_failures_are_detailed() {
    let pool = test_pool().await;
    let problem = ScenarioProblem::reset(&pool, 9001, 5).await;

    let resource_dir = test_config().resource_path.join("s5");
    tokio::fs::create_dir_all(&resource_dir).await.expect("create resource dir");
    tokio::fs::write(resource_dir.join("expected.txt"), "expected output\n")
        .await
        .expect("write expected output fixture");

    problem.testcase(&pool, "built", 0, "make", 0, None).await;
    problem
        .judge_testcase_with_stdout(&pool, 30, "./a.out case1", 0, "case 1 timed out", "s5/expected.txt")
        .await;
    problem
        .judge_testcase_with_stdout(&pool, 70, "./a.out case2", 0, "case 2 wrong answer", "s5/expected.txt")
        .await;

    let submission_id = problem.submit(&pool, false).await;

    let gateway = Arc::new(Gateway::new(pool.clone()));
    let submission = lease_one(&pool, submission_id).await;

    let sandbox = Arc::new(
        FakeSandbox::new()
            .script(
                &["./a.out", "case1"],
                ScriptedOutcome {
                    exit_code: Some(0),
                    stdout: "expected output\n".to_string(),
                    tle: true,
                    time_ms: 1500,
                    ..Default::default()
                },
            )
            .script(
                &["./a.out", "case2"],
                ScriptedOutcome {
                    exit_code: Some(0),
                    stdout: "something else\n".to_string(),
                    time_ms: 50,
                    ..Default::default()
                },
            ),
    );
    let pipeline = Pipeline::new(sandbox, gateway.clone(), test_config());
    pipeline.judge_one(submission).await.expect("judge_one");

    let (result, _message, detail, score) = fetch_summary(&pool, submission_id).await;
    assert_eq!(result, "TLE");
    assert_eq!(score, 0);
    assert!(detail.contains("case 1 timed out"));
    assert!(detail.contains("case 2 wrong answer"));

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT result FROM judge_results WHERE submission_id = $1 ORDER BY testcase_id ASC",
    )
    .bind(submission_id)
    .fetch_all(&pool)
    .await
    .expect("fetch judge results");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, "TLE");
    assert_eq!(rows[1].0, "WA");
}

/// S6 — crash recovery: two running submissions with one JudgeResult each
/// get put back to queued and their results wiped by `undo_running`.
#[tokio::test]
async fn s6_undo_running_clears_crashed_submissions() {
    let pool = test_pool().await;
    let problem = ScenarioProblem::reset(&pool, 9001, 6).await;
    let tc_id = problem.testcase(&pool, "judge", 10, "./a.out", 0, None).await;

    let gateway = Gateway::new(pool.clone());
    let mut submission_ids = Vec::new();
    for _ in 0..2 {
        let id = problem.submit(&pool, false).await;
        sqlx::query("UPDATE submissions SET progress = 'running' WHERE id = $1")
            .bind(id)
            .execute(&pool)
            .await
            .expect("flip to running");

        let result = gradecore::model::JudgeResult::new(
            0,
            chrono::Utc::now(),
            id,
            tc_id,
            gradecore::Verdict::Ac,
            "./a.out".to_string(),
            10,
            10,
            Some(0),
            "",
            "",
        );
        gateway.write_judge_result(&result).await.expect("write judge result");
        submission_ids.push(id);
    }

    gateway.undo_running().await.expect("undo_running");

    for id in submission_ids {
        let (progress,): (String,) = sqlx::query_as("SELECT progress FROM submissions WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .expect("fetch submission progress");
        assert_eq!(progress, "queued");

        let (result_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM judge_results WHERE submission_id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await
                .expect("count judge results");
        assert_eq!(result_count, 0);

        let (summary_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM submission_summaries WHERE submission_id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await
                .expect("count submission summaries");
        assert_eq!(summary_count, 0);
    }
}
