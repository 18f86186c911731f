//! External process execution.
//!
//! Every git/svn/compress step is a shell script invoked as
//! `sh <script> <working_dir> <step> [args...]`. The first argument after the
//! working directory names the step; errors carry it so callers can tell
//! which step of a sequence failed.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {script} for step `{step}`: {source}")]
    Spawn {
        script: PathBuf,
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Step `{step}` of {script} exited with {}: {stderr}", exit_label(.code))]
    Failed {
        script: PathBuf,
        step: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "signal".to_string(),
    }
}

impl ProcessError {
    pub fn step(&self) -> &str {
        match self {
            Self::Spawn { step, .. } | Self::Failed { step, .. } => step,
        }
    }
}

/// Runs an external script and returns its stdout.
///
/// Implementations block the calling task for the duration of the process;
/// callers that need one-at-a-time semantics serialize around this call.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn execute(
        &self,
        script: &Path,
        working_dir: &Path,
        args: &[String],
    ) -> Result<Vec<u8>, ProcessError>;
}

/// Runs scripts through `sh`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn execute(
        &self,
        script: &Path,
        working_dir: &Path,
        args: &[String],
    ) -> Result<Vec<u8>, ProcessError> {
        let step = args.first().cloned().unwrap_or_default();

        let output = Command::new(&self.shell)
            .arg(script)
            .arg(working_dir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                script: script.to_path_buf(),
                step: step.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProcessError::Failed {
                script: script.to_path_buf(),
                step,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(
            script = %script.display(),
            step = %step,
            bytes = output.stdout.len(),
            "script step finished"
        );
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("step.sh");
        fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn shell_runner_passes_working_dir_then_args() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "echo \"$1|$2|$3\"\n");

        let out = ShellRunner::new()
            .execute(&script, Path::new("/srv/work"), &["checkout".to_string(), "dev".to_string()])
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap().trim(), "/srv/work|checkout|dev");
    }

    #[tokio::test]
    async fn non_zero_exit_names_the_step() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "echo boom >&2\nexit 3\n");

        let err = ShellRunner::new()
            .execute(&script, dir.path(), &["push".to_string()])
            .await
            .unwrap_err();

        match &err {
            ProcessError::Failed { step, code, stderr, .. } => {
                assert_eq!(step, "push");
                assert_eq!(*code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert_eq!(err.step(), "push");
        assert!(err.to_string().contains("code 3"));
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "true\n");

        let err = ShellRunner::with_shell("/definitely/not/a/shell")
            .execute(&script, dir.path(), &["fetch".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert_eq!(err.step(), "fetch");
    }
}
