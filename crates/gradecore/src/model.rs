//! Persistent data model shared between the gateway and the pipeline.
//!
//! Identifiers are monotonic 64-bit integers (`BIGSERIAL` on the Postgres
//! side), matching the upstream schema this was distilled from — not
//! UUIDs. `Problem` is always handed around as a fully hydrated aggregate
//! (executables, arranged/required files, testcases already loaded) so the
//! pipeline never needs to go back to the database mid-judge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::verdict::Verdict;

/// Lifecycle state of a [`Submission`]. Wire values are part of the
/// external contract: `pending`, `queued`, `running`, `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Progress {
    Pending,
    Queued,
    Running,
    Done,
}

impl Progress {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Progress::Pending => "pending",
            Progress::Queued => "queued",
            Progress::Running => "running",
            Progress::Done => "done",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Progress::Pending),
            "queued" => Some(Progress::Queued),
            "running" => Some(Progress::Running),
            "done" => Some(Progress::Done),
            _ => None,
        }
    }
}

/// One judging job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub batch_id: Option<i64>,
    pub user_id: i64,
    pub lecture_id: i64,
    pub assignment_id: i64,
    /// Include evaluation-only testcases.
    pub eval: bool,
    pub progress: Progress,
    pub total_task: i32,
    pub completed_task: i32,
}

/// A file the student submitted. Immutable after intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: i64,
    pub submission_id: i64,
    /// Path relative to `UPLOAD_DIR_PATH`.
    pub path: String,
}

impl UploadedFile {
    /// The basename used for required-file matching in PreCheck.
    pub fn basename(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.path.as_str())
    }
}

/// A binary name that must exist in the working volume after compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executable {
    pub name: String,
}

/// An instructor-supplied file staged into the sandbox before compilation.
/// `path` is relative to `RESOURCE_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrangedFile {
    pub path: String,
}

/// A filename that must appear in the upload set (matched by basename).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredFile {
    pub name: String,
}

/// Whether a [`TestCase`] is a compile step or a post-build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestCaseType {
    Built,
    Judge,
}

/// One unit of execution within a problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub lecture_id: i64,
    pub assignment_id: i64,
    pub eval: bool,
    pub kind: TestCaseType,
    pub score: i32,
    pub title: String,
    pub description: Option<String>,
    pub message_on_fail: Option<String>,
    /// Shell-style command string, split on ASCII whitespace (no shell
    /// quoting semantics) to build the argv.
    pub command: String,
    pub args: Option<String>,
    /// Relative to `RESOURCE_PATH`.
    pub stdin_path: Option<String>,
    /// Relative to `RESOURCE_PATH`.
    pub stdout_path: Option<String>,
    /// Relative to `RESOURCE_PATH`.
    pub stderr_path: Option<String>,
    /// Expected exit code; 0 means "expect normal termination".
    pub exit_code: i32,
}

/// Identifies a problem by its natural composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProblemKey {
    pub lecture_id: i64,
    pub assignment_id: i64,
}

/// A fully hydrated problem aggregate: executables, arranged/required
/// files and testcases are loaded eagerly by the gateway so the pipeline
/// performs no further reads mid-judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub key: ProblemKey,
    /// Per-testcase wall-clock limit in milliseconds for `Judge` testcases.
    pub time_ms: u64,
    /// Per-testcase memory limit in megabytes for `Judge` testcases.
    pub memory_mb: u64,
    pub executables: Vec<Executable>,
    pub arranged_files: Vec<ArrangedFile>,
    pub required_files: Vec<RequiredFile>,
    pub testcases: Vec<TestCase>,
}

impl Problem {
    /// `Built` testcases in definition order, restricted to the ones a
    /// submission with this `eval` flag actually runs: non-evaluation
    /// testcases always run, evaluation-only ones only when `eval` is set.
    /// Must match the predicate `leaseQueued` uses to compute `total_task`,
    /// or `completed_task` can overshoot it.
    pub fn built_testcases(&self, eval: bool) -> impl Iterator<Item = &TestCase> {
        self.testcases
            .iter()
            .filter(|t| t.kind == TestCaseType::Built && (!t.eval || eval))
    }

    /// `Judge` testcases in definition order, same eval filtering as
    /// [`Self::built_testcases`].
    pub fn judge_testcases(&self, eval: bool) -> impl Iterator<Item = &TestCase> {
        self.testcases
            .iter()
            .filter(|t| t.kind == TestCaseType::Judge && (!t.eval || eval))
    }
}

/// Outcome of one testcase execution. Append-only per
/// `(submission_id, testcase_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResult {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub submission_id: i64,
    pub testcase_id: i64,
    pub result: Verdict,
    pub command: String,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub exit_code: Option<i32>,
    /// Clipped to 256 characters at construction time.
    pub stdout: String,
    /// Clipped to 256 characters at construction time.
    pub stderr: String,
}

/// Maximum length, in characters, stored for `JudgeResult.stdout/stderr`.
pub const OUTPUT_CLIP_CHARS: usize = 256;

/// Clip a string to [`OUTPUT_CLIP_CHARS`] characters (not bytes — this
/// slices on `char` boundaries so it never panics on multi-byte UTF-8).
pub fn clip_output(s: &str) -> String {
    s.chars().take(OUTPUT_CLIP_CHARS).collect()
}

impl JudgeResult {
    /// Construct a result with stdout/stderr clipped per the wire contract.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        ts: DateTime<Utc>,
        submission_id: i64,
        testcase_id: i64,
        result: Verdict,
        command: String,
        time_ms: u64,
        memory_kb: u64,
        exit_code: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) -> Self {
        Self {
            id,
            ts,
            submission_id,
            testcase_id,
            result,
            command,
            time_ms,
            memory_kb,
            exit_code,
            stdout: clip_output(stdout),
            stderr: clip_output(stderr),
        }
    }
}

/// One row per completed submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSummary {
    pub submission_id: i64,
    pub batch_id: Option<i64>,
    pub user_id: i64,
    pub result: Verdict,
    pub message: String,
    pub detail: String,
    pub score: i32,
    /// Worst (max) time across all testcase results.
    pub time_ms: u64,
    /// Worst (max) memory across all testcase results.
    pub memory_kb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_directory_components() {
        let f = UploadedFile {
            id: 1,
            submission_id: 1,
            path: "sub/dir/main.c".to_string(),
        };
        assert_eq!(f.basename(), "main.c");
    }

    #[test]
    fn clip_output_respects_char_boundaries() {
        let s: String = std::iter::repeat('a').take(300).collect();
        assert_eq!(clip_output(&s).chars().count(), OUTPUT_CLIP_CHARS);

        let multibyte: String = std::iter::repeat('あ').take(300).collect();
        let clipped = clip_output(&multibyte);
        assert_eq!(clipped.chars().count(), OUTPUT_CLIP_CHARS);
    }

    #[test]
    fn clip_output_is_noop_under_limit() {
        assert_eq!(clip_output("short"), "short");
    }
}
