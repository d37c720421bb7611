//! Running a job's command.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use jobq_core::{ExecutionOutcome, NO_EXIT_CODE};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long captured output may keep draining after a timed-out command has
/// been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Runs a command to completion or until `timeout`, never longer.
///
/// Every result is an [`ExecutionOutcome`]; failing to run at all is just a
/// failed outcome.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> ExecutionOutcome;
}

/// Executes commands through the platform shell.
///
/// Stdout and stderr are captured and joined (stdout first). On unix the
/// shell leads its own process group, and a command that outlives its
/// timeout has the whole group killed, so background children go with it.
/// Output captured before the kill is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    fn command(line: &str) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C");
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c");
            cmd
        };
        cmd.arg(line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

type Captured = Arc<Mutex<Vec<u8>>>;

/// Copy `pipe` into a shared buffer until EOF.
fn capture<R>(pipe: Option<R>) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Captured::default();
    let sink = buffer.clone();
    let task = tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
            }
        }
    });
    (buffer, task)
}

fn combined(stdout: &Captured, stderr: &Captured) -> String {
    let mut text =
        String::from_utf8_lossy(&stdout.lock().unwrap_or_else(PoisonError::into_inner))
            .into_owned();
    text.push_str(&String::from_utf8_lossy(
        &stderr.lock().unwrap_or_else(PoisonError::into_inner),
    ));
    text
}

/// Kill the shell and, on unix, every process in its group.
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(pid, error = %e, "process group already gone");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill timed-out command");
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> ExecutionOutcome {
        let mut child = match Self::command(command).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::failure(
                    NO_EXIT_CODE,
                    Some(format!("failed to start command: {e}")),
                    "",
                );
            }
        };
        // Taken before waiting: the group outlives a reaped leader.
        let pid = child.id();
        let (stdout, mut stdout_task) = capture(child.stdout.take());
        let (stderr, mut stderr_task) = capture(child.stderr.take());

        let finished = tokio::time::timeout(timeout, async {
            let status = child.wait().await;
            let _ = tokio::join!(&mut stdout_task, &mut stderr_task);
            status
        })
        .await;

        let status = match finished {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return ExecutionOutcome::failure(
                    NO_EXIT_CODE,
                    Some(format!("failed to wait for command: {e}")),
                    combined(&stdout, &stderr),
                );
            }
            Err(_) => {
                kill_tree(&mut child, pid).await;
                let drained = tokio::time::timeout(DRAIN_GRACE, async {
                    let _ = tokio::join!(&mut stdout_task, &mut stderr_task);
                })
                .await;
                if drained.is_err() {
                    stdout_task.abort();
                    stderr_task.abort();
                }
                return ExecutionOutcome::timed_out(timeout, combined(&stdout, &stderr));
            }
        };

        debug!(exit_code = ?status.code(), "command finished");

        let output = combined(&stdout, &stderr);
        if status.success() {
            ExecutionOutcome::success(output)
        } else {
            ExecutionOutcome::failure(
                status.code().unwrap_or(NO_EXIT_CODE),
                Some(status.to_string()),
                output,
            )
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn zero_exit_is_success_with_output() {
        let outcome = ShellExecutor.run("echo hello", TIMEOUT).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.output, "hello\n");
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_combined() {
        let outcome = ShellExecutor.run("echo out; echo err >&2", TIMEOUT).await;
        assert!(outcome.output.contains("out"));
        assert!(outcome.output.contains("err"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let outcome = ShellExecutor.run("echo nope; exit 3", TIMEOUT).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.error.is_some());
        assert!(outcome.diagnostic().starts_with("exit=3 "));
    }

    #[tokio::test]
    async fn unknown_command_fails() {
        let outcome = ShellExecutor
            .run("definitely-not-a-real-command-jobq", TIMEOUT)
            .await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code, 127);
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let started = std::time::Instant::now();
        let outcome = ShellExecutor.run("sleep 5", Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(outcome.exit_code, NO_EXIT_CODE);
        assert!(outcome.error.as_deref().unwrap_or_default().starts_with("timed out"));
    }

    #[tokio::test]
    async fn timeout_kills_background_children_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let line = format!(
            "echo partial; (sleep 1 && touch '{}') & wait",
            marker.display()
        );

        let outcome = ShellExecutor.run(&line, Duration::from_millis(300)).await;
        assert_eq!(outcome.exit_code, NO_EXIT_CODE);
        assert_eq!(outcome.output, "partial\n");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background child survived the timeout");
    }
}
