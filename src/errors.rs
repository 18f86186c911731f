//! Typed error hierarchy for the release coordinator.
//!
//! One enum per collaborator, folded into `CoordinatorError` at the
//! coordinator boundary:
//! - `GitError` — branch registry, command loop and git script steps
//! - `SvnError` — svn script steps and log parsing
//! - `FtpError` — artifact drop transfers and listing filters
//! - `NoticeError` — release notice object storage
//! - `WorkerError` — task queue admission

use std::path::PathBuf;
use std::time::Duration;

use shipwright_common::ProcessError;
use thiserror::Error;

/// Coarse classification used by callers that only care about the failure
/// category, not the collaborator that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    ExternalProcess,
    Precondition,
    Backpressure,
    Internal,
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Branch `{branch}` does not exist in project {project}")]
    BranchNotFound { project: String, branch: String },

    #[error("Branch `{branch}` of project {project} has no release tag")]
    MissingReleaseTag { project: String, branch: String },

    #[error("Git step `{step}` failed for project {project}: {source}")]
    Step {
        project: String,
        step: &'static str,
        #[source]
        source: ProcessError,
    },

    #[error("Git command `{command}` for project {project} was not queued within {timeout:?}")]
    Backpressure {
        project: String,
        command: String,
        timeout: Duration,
    },

    #[error("Git command loop for project {project} has stopped")]
    LoopStopped { project: String },
}

#[derive(Debug, Error)]
pub enum SvnError {
    #[error("Svn step `{step}` failed for project {project}: {source}")]
    Step {
        project: String,
        step: &'static str,
        #[source]
        source: ProcessError,
    },

    #[error("Failed to parse svn log for project {project}: {source}")]
    LogParse {
        project: String,
        #[source]
        source: roxmltree::Error,
    },
}

#[derive(Debug, Error)]
pub enum FtpError {
    #[error("Failed to run curl for ftp {operation}: {source}")]
    Spawn {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Ftp {operation} of `{target}` failed: {message}")]
    Transfer {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("Invalid listing filter `{pattern}`: {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Artifact {path} does not exist")]
    MissingArtifact { path: PathBuf },

    #[error("`{name}` is not a plain file name in the drop directory")]
    InvalidName { name: String },

    #[error("Failed to stage ftp upload: {0}")]
    Stage(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NoticeError {
    #[error("Notice environment `{env}` is not configured")]
    UnknownEnv { env: String },

    #[error("Object storage request for `{key}` failed: {source}")]
    Http {
        key: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Object storage returned {status} for `{key}`")]
    Status { key: String, status: u16 },

    #[error("Failed to encode notice: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to sign object storage request for `{key}`")]
    Signing { key: String },
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Task queue for project {project} is full; task {task_id} was not queued")]
    QueueFull { project: String, task_id: u64 },

    #[error("Worker for project {project} has shut down")]
    Stopped { project: String },
}

/// Errors surfaced by the project coordinator to the HTTP layer and worker.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Project {name} is not configured")]
    ProjectNotFound { name: String },

    #[error("Task {id} not found in project {project}")]
    TaskNotFound { project: String, id: u64 },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Svn(#[from] SvnError),

    #[error(transparent)]
    Ftp(#[from] FtpError),

    #[error(transparent)]
    Notice(#[from] NoticeError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProjectNotFound { .. } | Self::TaskNotFound { .. } => ErrorKind::NotFound,
            Self::Git(GitError::BranchNotFound { .. }) => ErrorKind::NotFound,
            Self::Git(GitError::MissingReleaseTag { .. }) => ErrorKind::Precondition,
            Self::Git(GitError::Step { .. }) => ErrorKind::ExternalProcess,
            Self::Git(GitError::Backpressure { .. }) => ErrorKind::Backpressure,
            Self::Git(GitError::LoopStopped { .. }) => ErrorKind::Internal,
            Self::Svn(_) => ErrorKind::ExternalProcess,
            Self::Ftp(FtpError::InvalidFilter { .. } | FtpError::InvalidName { .. }) => {
                ErrorKind::Precondition
            }
            Self::Ftp(FtpError::Stage(_)) => ErrorKind::Internal,
            Self::Ftp(FtpError::MissingArtifact { .. }) => ErrorKind::NotFound,
            Self::Ftp(_) => ErrorKind::ExternalProcess,
            Self::Notice(NoticeError::UnknownEnv { .. }) => ErrorKind::NotFound,
            Self::Notice(NoticeError::Encode(_) | NoticeError::Signing { .. }) => ErrorKind::Internal,
            Self::Notice(_) => ErrorKind::ExternalProcess,
            Self::Worker(WorkerError::QueueFull { .. }) => ErrorKind::Backpressure,
            Self::Worker(WorkerError::Stopped { .. }) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_error(step: &str) -> ProcessError {
        ProcessError::Failed {
            script: PathBuf::from("/opt/scripts/git.sh"),
            step: step.to_string(),
            code: Some(1),
            stderr: "fatal".to_string(),
        }
    }

    #[test]
    fn git_step_error_names_the_step() {
        let err = GitError::Step {
            project: "helix".into(),
            step: "push",
            source: step_error("push"),
        };
        let msg = err.to_string();
        assert!(msg.contains("`push`"));
        assert!(msg.contains("helix"));
    }

    #[test]
    fn coordinator_error_converts_from_git_error() {
        let inner = GitError::MissingReleaseTag {
            project: "helix".into(),
            branch: "feature-x".into(),
        };
        let err: CoordinatorError = inner.into();
        match &err {
            CoordinatorError::Git(GitError::MissingReleaseTag { branch, .. }) => {
                assert_eq!(branch, "feature-x");
            }
            _ => panic!("Expected CoordinatorError::Git(MissingReleaseTag)"),
        }
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn kinds_follow_the_failure_taxonomy() {
        let not_found = CoordinatorError::ProjectNotFound { name: "x".into() };
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let branch: CoordinatorError = GitError::BranchNotFound {
            project: "p".into(),
            branch: "b".into(),
        }
        .into();
        assert_eq!(branch.kind(), ErrorKind::NotFound);

        let process: CoordinatorError = GitError::Step {
            project: "p".into(),
            step: "checkout",
            source: step_error("checkout"),
        }
        .into();
        assert_eq!(process.kind(), ErrorKind::ExternalProcess);

        let timeout: CoordinatorError = GitError::Backpressure {
            project: "p".into(),
            command: "generate dev".into(),
            timeout: Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.kind(), ErrorKind::Backpressure);

        let full: CoordinatorError = WorkerError::QueueFull {
            project: "p".into(),
            task_id: 7,
        }
        .into();
        assert_eq!(full.kind(), ErrorKind::Backpressure);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GitError::LoopStopped { project: "p".into() });
        assert_std_error(&SvnError::Step {
            project: "p".into(),
            step: "update",
            source: step_error("update"),
        });
        assert_std_error(&FtpError::MissingArtifact {
            path: PathBuf::from("/tmp/a.zip"),
        });
        assert_std_error(&NoticeError::UnknownEnv { env: "dev".into() });
        assert_std_error(&WorkerError::Stopped { project: "p".into() });
    }
}
