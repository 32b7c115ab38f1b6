//! Domain error kinds for the judge service.
//!
//! Covers only the error-table rows that the pipeline actually constructs
//! and pattern-matches into a submission verdict (`ProblemMissing`,
//! `SandboxSetup`, `SandboxExec`). The FN/CE rows of that table
//! (`MissingRequiredFile`, `CompileFail`, `MissingArtifact`) are surfaced
//! to the submission as the exact Japanese wire-contract strings
//! (`MSG_MISSING_REQUIRED_FILE` etc. in `pipeline.rs`), not through this
//! enum's `Display`, so there is no variant for them here. `TransientDB`
//! and `CleanupFailure` stay as plain `anyhow::Result`/`tracing::warn!`
//! at their call sites (gateway query errors, sandbox teardown) — neither
//! is ever pattern-matched into a verdict, so a typed variant would have
//! no reader.
use thiserror::Error;

/// Domain-level error for the judging pipeline.
#[derive(Error, Debug)]
pub enum JudgeError {
    /// `fetchProblem` found no matching `(lecture_id, assignment_id)`.
    #[error("problem not found: lecture={lecture_id} assignment={assignment_id}")]
    ProblemMissing {
        lecture_id: i64,
        assignment_id: i64,
    },

    /// Volume or container create/copy failed before any testcase ran.
    #[error("sandbox setup failed: {0}")]
    SandboxSetup(String),

    /// The sandbox runtime itself errored while executing a testcase
    /// (not a testcase failure — the sandbox could not produce a result).
    #[error("sandbox execution failed: {0}")]
    SandboxExec(String),
}
