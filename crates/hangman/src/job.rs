//! Jobs run by the execution queue.
//!
//! [`Job`] is the contract the queue schedules against. [`CommandJob`] is the
//! concrete job: one forwarded command line run as a child process.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobStatus {
    Queued = 0,
    Executing = 1,
    Complete = 2,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Executing => "Executing",
            Self::Complete => "Complete",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Executing,
            _ => Self::Complete,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("job already started")]
    AlreadyStarted,
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("job is not running")]
    NotRunning,
}

/// How a job finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobExit {
    Exited(ExitStatus),
    /// The job never ran to an exit status (start or wait failure).
    Failed(String),
}

impl JobExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(status) if status.success())
    }
}

impl fmt::Display for JobExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "{status}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A unit of work the queue can start, observe, and kill.
#[async_trait]
pub trait Job: fmt::Display + Send + Sync + 'static {
    /// Start the job. Called once, when the queue admits it.
    fn begin_execute(&self) -> Result<(), JobError>;

    fn status(&self) -> JobStatus;

    /// Force-terminate. Fails with [`JobError::NotRunning`] unless executing.
    fn kill(&self) -> Result<(), JobError>;

    /// Resolves once the job has finished. Never resolves for a job that was
    /// not started.
    async fn completed(&self) -> JobExit;
}

struct ExecutionState {
    status: AtomicU8,
    /// 0 while no child is running. Informational only; signals go through
    /// the task that owns the child.
    pid: AtomicI32,
    /// Cancelled to ask the waiter task to SIGKILL the child.
    kill_switch: CancellationToken,
    exit: watch::Sender<Option<JobExit>>,
}

impl ExecutionState {
    fn finish(&self, exit: JobExit) {
        self.pid.store(0, Ordering::Release);
        self.status
            .store(JobStatus::Complete as u8, Ordering::Release);
        self.exit.send_replace(Some(exit));
    }
}

/// A forwarded command line, run in the caller's working directory with the
/// caller's environment overlaid on the primary's.
pub struct CommandJob {
    args: Vec<String>,
    working_directory: PathBuf,
    environment: BTreeMap<String, String>,
    state: Arc<ExecutionState>,
}

impl CommandJob {
    pub fn new(
        args: Vec<String>,
        working_directory: impl Into<PathBuf>,
        environment: BTreeMap<String, String>,
    ) -> Result<Self, JobError> {
        if args.is_empty() {
            return Err(JobError::EmptyCommand);
        }
        let (exit, _) = watch::channel(None);
        Ok(Self {
            args,
            working_directory: working_directory.into(),
            environment,
            state: Arc::new(ExecutionState {
                status: AtomicU8::new(JobStatus::Queued as u8),
                pid: AtomicI32::new(0),
                kill_switch: CancellationToken::new(),
                exit,
            }),
        })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn pid(&self) -> Option<i32> {
        match self.state.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

#[async_trait]
impl Job for CommandJob {
    fn begin_execute(&self) -> Result<(), JobError> {
        self.state
            .status
            .compare_exchange(
                JobStatus::Queued as u8,
                JobStatus::Executing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| JobError::AlreadyStarted)?;

        let (program, rest) = self.args.split_first().ok_or(JobError::EmptyCommand)?;
        let spawned = Command::new(program)
            .args(rest)
            .current_dir(&self.working_directory)
            .envs(&self.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                self.state.finish(JobExit::Failed(source.to_string()));
                return Err(JobError::Start {
                    program: program.clone(),
                    source,
                });
            }
        };

        let pid = child.id().and_then(|id| i32::try_from(id).ok()).unwrap_or(0);
        self.state.pid.store(pid, Ordering::Release);

        let label = self.to_string();
        tracing::info!(pid, job = %label, "Job started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout", pid));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr", pid));
        }

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => status,
                _ = state.kill_switch.cancelled() => {
                    sigkill(&child);
                    child.wait().await
                }
            };
            let exit = match waited {
                Ok(status) => JobExit::Exited(status),
                Err(e) => JobExit::Failed(e.to_string()),
            };
            tracing::info!(pid, job = %label, exit = %exit, "Job finished");
            state.finish(exit);
        });

        Ok(())
    }

    fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.state.status.load(Ordering::Acquire))
    }

    fn kill(&self) -> Result<(), JobError> {
        if self.status() != JobStatus::Executing {
            return Err(JobError::NotRunning);
        }
        self.state.kill_switch.cancel();
        Ok(())
    }

    async fn completed(&self) -> JobExit {
        let mut exit = self.state.exit.subscribe();
        let finished = exit.wait_for(Option::is_some).await.map(|e| e.clone());
        match finished {
            Ok(Some(exit)) => exit,
            _ => JobExit::Failed("execution state dropped".to_string()),
        }
    }
}

impl fmt::Display for CommandJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.contains(' ') {
                write!(f, "\"{arg}\"")?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

/// SIGKILL a child that has not been reaped yet. Returns whether a signal was
/// sent; a reaped child has no pid, so its number is never reused here.
fn sigkill(child: &Child) -> bool {
    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => {
            tracing::info!(pid, "Job killed");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to kill job");
            false
        }
    }
}

async fn forward_lines<R>(reader: R, stream: &'static str, pid: i32)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(target: "hangman::job", pid, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(pid, stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;

    use super::*;

    fn job(args: &[&str]) -> CommandJob {
        CommandJob::new(
            args.iter().map(|a| a.to_string()).collect(),
            std::env::temp_dir(),
            BTreeMap::new(),
        )
        .unwrap()
    }

    async fn completed(job: &CommandJob) -> JobExit {
        tokio::time::timeout(Duration::from_secs(10), job.completed())
            .await
            .expect("job did not finish")
    }

    #[test]
    fn empty_command_is_rejected() {
        let result = CommandJob::new(Vec::new(), "/", BTreeMap::new());
        assert!(matches!(result, Err(JobError::EmptyCommand)));
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let job = job(&["echo", "hello world", "x"]);
        assert_eq!(job.to_string(), "echo \"hello world\" x");
        assert_eq!(job.args(), ["echo", "hello world", "x"]);
    }

    #[test]
    fn kill_before_start_is_not_running() {
        let job = job(&["true"]);
        assert_eq!(job.status(), JobStatus::Queued);
        assert!(matches!(job.kill(), Err(JobError::NotRunning)));
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let job = job(&["true"]);
        job.begin_execute().unwrap();

        let exit = completed(&job).await;
        assert!(exit.success());
        assert_eq!(job.status(), JobStatus::Complete);
        assert_eq!(job.pid(), None);
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let job = job(&["sh", "-c", "exit 3"]);
        job.begin_execute().unwrap();

        let JobExit::Exited(status) = completed(&job).await else {
            panic!("expected exit status");
        };
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn second_begin_fails() {
        let job = job(&["true"]);
        job.begin_execute().unwrap();
        assert!(matches!(job.begin_execute(), Err(JobError::AlreadyStarted)));
        completed(&job).await;
    }

    #[tokio::test]
    async fn runs_in_working_directory_with_overlaid_environment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();

        let job = CommandJob::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "test -f marker && test -n \"$PATH\" && exit $HANGMAN_TEST_CODE".to_string(),
            ],
            dir.path(),
            BTreeMap::from([("HANGMAN_TEST_CODE".to_string(), "7".to_string())]),
        )
        .unwrap();
        job.begin_execute().unwrap();

        let JobExit::Exited(status) = completed(&job).await else {
            panic!("expected exit status");
        };
        assert_eq!(status.code(), Some(7));
    }

    #[tokio::test]
    async fn kill_terminates_running_job() {
        let job = job(&["sleep", "30"]);
        job.begin_execute().unwrap();
        assert_eq!(job.status(), JobStatus::Executing);

        job.kill().unwrap();

        let JobExit::Exited(status) = completed(&job).await else {
            panic!("expected exit status");
        };
        assert_eq!(status.signal(), Some(9));
        assert!(matches!(job.kill(), Err(JobError::NotRunning)));
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let job = job(&["/nonexistent/hangman-test-binary"]);

        let err = job.begin_execute().unwrap_err();
        assert!(matches!(err, JobError::Start { .. }));
        assert_eq!(job.status(), JobStatus::Complete);
        assert!(!completed(&job).await.success());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Executing).unwrap();
        assert_eq!(json, "\"executing\"");
        assert_eq!(JobStatus::Executing.to_string(), "Executing");
    }

    #[tokio::test]
    async fn reaped_child_is_never_signalled() {
        let mut child = Command::new("true").spawn().unwrap();
        assert!(child.wait().await.unwrap().success());

        assert!(!sigkill(&child));
    }

    #[tokio::test]
    async fn kill_right_after_start_still_terminates() {
        let job = job(&["sleep", "30"]);
        job.begin_execute().unwrap();
        job.kill().unwrap();
        job.kill().unwrap();

        let JobExit::Exited(status) = completed(&job).await else {
            panic!("expected exit status");
        };
        assert_eq!(status.signal(), Some(9));
        assert_eq!(job.pid(), None);
    }
}
