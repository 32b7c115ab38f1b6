//! Problem Store Gateway (C2): the only component that talks to Postgres.
//!
//! Every read is an eager fetch — `fetch_problem` returns a fully hydrated
//! aggregate so the pipeline never goes back to the database mid-judge.
//! Writes that must be atomic (`lease_queued`, `undo_running`,
//! `write_submission_summary`) run inside one `sqlx::Transaction`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gradecore::model::{
    ArrangedFile, Executable, JudgeResult, Problem, ProblemKey, Progress, RequiredFile,
    Submission, SubmissionSummary, TestCase, TestCaseType, UploadedFile,
};
use sqlx::{FromRow, PgPool};

pub struct Gateway {
    pool: PgPool,
}

#[derive(FromRow)]
struct SubmissionRow {
    id: i64,
    ts: DateTime<Utc>,
    batch_id: Option<i64>,
    user_id: i64,
    lecture_id: i64,
    assignment_id: i64,
    eval: bool,
}

impl Gateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically lease up to `n` queued submissions, flipping them to
    /// `running` and computing `total_task` for each. FIFO by submission
    /// id. On any failure the transaction rolls back and an empty Vec is
    /// returned — the caller logs, the scheduler never sees an error here.
    pub async fn lease_queued(&self, n: i64) -> Vec<Submission> {
        match self.lease_queued_inner(n).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "lease_queued failed, rolling back");
                Vec::new()
            }
        }
    }

    async fn lease_queued_inner(&self, n: i64) -> Result<Vec<Submission>> {
        let mut tx = self.pool.begin().await.context("begin lease transaction")?;

        let rows: Vec<SubmissionRow> = sqlx::query_as(
            r#"
            SELECT id, ts, batch_id, user_id, lecture_id, assignment_id, eval
            FROM submissions
            WHERE progress = 'queued'
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(n)
        .fetch_all(&mut *tx)
        .await
        .context("select queued submissions")?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let total_task: (i64,) = sqlx::query_as(
                r#"
                SELECT COUNT(*) FROM testcases
                WHERE lecture_id = $1 AND assignment_id = $2 AND (eval = $3 OR eval = false)
                "#,
            )
            .bind(row.lecture_id)
            .bind(row.assignment_id)
            .bind(row.eval)
            .fetch_one(&mut *tx)
            .await
            .context("count testcases for lease")?;

            sqlx::query(
                r#"
                UPDATE submissions
                SET progress = 'running', total_task = $2, completed_task = 0
                WHERE id = $1
                "#,
            )
            .bind(row.id)
            .bind(total_task.0 as i32)
            .execute(&mut *tx)
            .await
            .context("flip submission to running")?;

            leased.push(Submission {
                id: row.id,
                ts: row.ts,
                batch_id: row.batch_id,
                user_id: row.user_id,
                lecture_id: row.lecture_id,
                assignment_id: row.assignment_id,
                eval: row.eval,
                progress: Progress::Running,
                total_task: total_task.0 as i32,
                completed_task: 0,
            });
        }

        tx.commit().await.context("commit lease transaction")?;
        Ok(leased)
    }

    /// Crash/shutdown recovery: flip every `running` submission back to
    /// `queued` and delete any results it had accumulated. Run at both
    /// service startup and clean shutdown.
    pub async fn undo_running(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin undo_running transaction")?;

        let running_ids: Vec<(i64,)> =
            sqlx::query_as(r#"SELECT id FROM submissions WHERE progress = 'running'"#)
                .fetch_all(&mut *tx)
                .await
                .context("select running submissions")?;
        let running_ids: Vec<i64> = running_ids.into_iter().map(|(id,)| id).collect();

        if !running_ids.is_empty() {
            sqlx::query(r#"UPDATE submissions SET progress = 'queued' WHERE progress = 'running'"#)
                .execute(&mut *tx)
                .await
                .context("reset running submissions to queued")?;

            sqlx::query(r#"DELETE FROM judge_results WHERE submission_id = ANY($1)"#)
                .bind(&running_ids)
                .execute(&mut *tx)
                .await
                .context("delete judge results for recovered submissions")?;

            sqlx::query(r#"DELETE FROM submission_summaries WHERE submission_id = ANY($1)"#)
                .bind(&running_ids)
                .execute(&mut *tx)
                .await
                .context("delete submission summaries for recovered submissions")?;
        }

        tx.commit().await.context("commit undo_running transaction")?;
        tracing::info!(count = running_ids.len(), "undo_running recovered submissions");
        Ok(())
    }

    /// Persist the mutable progress triple.
    pub async fn update_submission(&self, submission: &Submission) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE submissions
            SET progress = $2, total_task = $3, completed_task = $4
            WHERE id = $1
            "#,
        )
        .bind(submission.id)
        .bind(submission.progress.as_db_str())
        .bind(submission.total_task)
        .bind(submission.completed_task)
        .execute(&self.pool)
        .await
        .context("update_submission")?;
        Ok(())
    }

    /// Append one testcase result row.
    pub async fn write_judge_result(&self, result: &JudgeResult) -> Result<()> {
        bind_judge_result(sqlx::query(
            r#"
            INSERT INTO judge_results
                (ts, submission_id, testcase_id, result, command, time_ms, memory_kb, exit_code, stdout, stderr)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        ), result)
        .execute(&self.pool)
        .await
        .context("write_judge_result")?;
        Ok(())
    }

    /// Write the submission summary and every accumulated `JudgeResult` row
    /// atomically, then flip `progress=done`.
    pub async fn write_submission_summary(
        &self,
        submission: &Submission,
        summary: &SubmissionSummary,
        results: &[JudgeResult],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin write_submission_summary transaction")?;

        for result in results {
            bind_judge_result(
                sqlx::query(
                    r#"
                    INSERT INTO judge_results
                        (ts, submission_id, testcase_id, result, command, time_ms, memory_kb, exit_code, stdout, stderr)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                ),
                result,
            )
            .execute(&mut *tx)
            .await
            .context("insert judge result in summary transaction")?;
        }

        sqlx::query(
            r#"
            INSERT INTO submission_summaries
                (submission_id, batch_id, user_id, result, message, detail, score, time_ms, memory_kb)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(summary.submission_id)
        .bind(summary.batch_id)
        .bind(summary.user_id)
        .bind(summary.result.code())
        .bind(&summary.message)
        .bind(&summary.detail)
        .bind(summary.score)
        .bind(summary.time_ms as i64)
        .bind(summary.memory_kb as i64)
        .execute(&mut *tx)
        .await
        .context("insert submission summary")?;

        sqlx::query(
            r#"
            UPDATE submissions
            SET progress = 'done', total_task = $2, completed_task = $3
            WHERE id = $1
            "#,
        )
        .bind(submission.id)
        .bind(submission.total_task)
        .bind(submission.completed_task)
        .execute(&mut *tx)
        .await
        .context("flip submission to done")?;

        tx.commit().await.context("commit write_submission_summary transaction")?;
        Ok(())
    }

    /// Eager-fetch a problem aggregate: executables, arranged/required
    /// files and testcases, all loaded up front.
    pub async fn fetch_problem(&self, key: ProblemKey) -> Result<Option<Problem>> {
        let header: Option<(i64, i64)> = sqlx::query_as(
            r#"SELECT time_ms, memory_mb FROM problems WHERE lecture_id = $1 AND assignment_id = $2"#,
        )
        .bind(key.lecture_id)
        .bind(key.assignment_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch problem header")?;

        let Some((time_ms, memory_mb)) = header else {
            return Ok(None);
        };

        let executables: Vec<(String,)> = sqlx::query_as(
            r#"SELECT name FROM executables WHERE lecture_id = $1 AND assignment_id = $2"#,
        )
        .bind(key.lecture_id)
        .bind(key.assignment_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch executables")?;
        let executables = executables.into_iter().map(|(name,)| Executable { name }).collect();

        let arranged_files: Vec<(String,)> = sqlx::query_as(
            r#"SELECT path FROM arranged_files WHERE lecture_id = $1 AND assignment_id = $2"#,
        )
        .bind(key.lecture_id)
        .bind(key.assignment_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch arranged files")?;
        let arranged_files = arranged_files.into_iter().map(|(path,)| ArrangedFile { path }).collect();

        let required_files: Vec<(String,)> = sqlx::query_as(
            r#"SELECT name FROM required_files WHERE lecture_id = $1 AND assignment_id = $2"#,
        )
        .bind(key.lecture_id)
        .bind(key.assignment_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch required files")?;
        let required_files = required_files.into_iter().map(|(name,)| RequiredFile { name }).collect();

        let testcase_rows: Vec<TestCaseRow> = sqlx::query_as(
            r#"
            SELECT id, eval, kind, score, title, description, message_on_fail,
                   command, args, stdin_path, stdout_path, stderr_path, exit_code
            FROM testcases
            WHERE lecture_id = $1 AND assignment_id = $2
            ORDER BY id ASC
            "#,
        )
        .bind(key.lecture_id)
        .bind(key.assignment_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch testcases")?;

        let testcases = testcase_rows
            .into_iter()
            .map(|r| TestCase {
                id: r.id,
                lecture_id: key.lecture_id,
                assignment_id: key.assignment_id,
                eval: r.eval,
                kind: if r.kind == "built" {
                    TestCaseType::Built
                } else {
                    TestCaseType::Judge
                },
                score: r.score,
                title: r.title,
                description: r.description,
                message_on_fail: r.message_on_fail,
                command: r.command,
                args: r.args,
                stdin_path: r.stdin_path,
                stdout_path: r.stdout_path,
                stderr_path: r.stderr_path,
                exit_code: r.exit_code,
            })
            .collect();

        Ok(Some(Problem {
            key,
            time_ms: time_ms as u64,
            memory_mb: memory_mb as u64,
            executables,
            arranged_files,
            required_files,
            testcases,
        }))
    }

    /// Files the student uploaded for a submission.
    pub async fn fetch_uploaded_files(&self, submission_id: i64) -> Result<Vec<UploadedFile>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as(r#"SELECT id, path FROM uploaded_files WHERE submission_id = $1"#)
                .bind(submission_id)
                .fetch_all(&self.pool)
                .await
                .context("fetch uploaded files")?;

        Ok(rows
            .into_iter()
            .map(|(id, path)| UploadedFile {
                id,
                submission_id,
                path,
            })
            .collect())
    }
}

#[derive(FromRow)]
struct TestCaseRow {
    id: i64,
    eval: bool,
    kind: String,
    score: i32,
    title: String,
    description: Option<String>,
    message_on_fail: Option<String>,
    command: String,
    args: Option<String>,
    stdin_path: Option<String>,
    stdout_path: Option<String>,
    stderr_path: Option<String>,
    exit_code: i32,
}

fn bind_judge_result<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    result: &'q JudgeResult,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(result.ts)
        .bind(result.submission_id)
        .bind(result.testcase_id)
        .bind(result.result.code())
        .bind(&result.command)
        .bind(result.time_ms as i64)
        .bind(result.memory_kb as i64)
        .bind(result.exit_code)
        .bind(&result.stdout)
        .bind(&result.stderr)
}

/// Timestamp helper so callers building a `JudgeResult` row don't reach for
/// `chrono::Utc::now()` directly scattered across the pipeline.
pub fn now_ts() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(all(test, feature = "db-tests"))]
mod db_tests {
    use super::*;

    async fn test_pool() -> PgPool {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for db-tests");
        PgPool::connect(&url).await.expect("connect to test database")
    }

    #[tokio::test]
    async fn lease_queued_returns_at_most_n_and_marks_running() {
        let pool = test_pool().await;
        let gw = Gateway::new(pool);
        let leased = gw.lease_queued(5).await;
        for s in &leased {
            assert_eq!(s.progress, Progress::Running);
        }
    }

    #[tokio::test]
    async fn undo_running_clears_every_running_submission() {
        let pool = test_pool().await;
        let gw = Gateway::new(pool);
        gw.undo_running().await.expect("undo_running");
    }
}
