//! External command execution with timeout, stream capture and failure
//! classification.

use std::{fmt, io, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    Timeout,
    ToolMissing { command: String },
    /// Ran to completion with a non-zero status. `None` when killed by a signal.
    Exited { code: Option<i32> },
    Unexpected { cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub combined_output: String,
    pub failure: Option<RunFailure>,
}

impl CommandResult {
    pub fn succeeded(combined_output: String) -> Self {
        Self { success: true, combined_output, failure: None }
    }

    pub fn failed(failure: RunFailure, combined_output: String) -> Self {
        Self { success: false, combined_output, failure: Some(failure) }
    }

    fn timed_out(label: &str) -> Self {
        Self::failed(
            RunFailure::Timeout,
            format!("{label} failed! Timeout: Process took too long to complete."),
        )
    }

    fn tool_missing(label: &str, command: &str) -> Self {
        Self::failed(
            RunFailure::ToolMissing { command: command.to_string() },
            format!("{label} failed! Command '{command}' not found. Please install it."),
        )
    }

    fn unexpected(label: &str, cause: impl fmt::Display) -> Self {
        let cause = cause.to_string();
        let text = format!("{label} failed! Error: {cause}");
        Self::failed(RunFailure::Unexpected { cause }, text)
    }
}

/// Seam between the pipeline and the operating system.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], label: &str, timeout: Duration) -> CommandResult;
}

/// stdout, then a newline if both are present, then stderr.
pub fn merge_output(stdout: &str, stderr: &str) -> String {
    let mut body = String::new();
    if !stdout.is_empty() {
        body.push_str(stdout);
    }
    if !stderr.is_empty() {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(stderr);
    }
    body
}

/// Spawns commands directly (never through a shell).
///
/// On Unix each command leads its own process group, and everything in that
/// group is killed once the step is over, so wrapper scripts that fork a JVM
/// or leave background jobs behind cannot outlive their step.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], label: &str, limit: Duration) -> CommandResult {
        let Some((program, args)) = argv.split_first() else {
            return CommandResult::unexpected(label, "empty command line");
        };
        info!(step = label, command = %argv.join(" "), "executing");

        let mut child = match command(program, args).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(step = label, command = %program, "command not found");
                return CommandResult::tool_missing(label, program);
            }
            Err(e) => {
                warn!(step = label, error = %e, "spawn failed");
                return CommandResult::unexpected(label, e);
            }
        };
        let mut group = ProcessGroup::of(&child);

        let mut stdout = child.stdout.take().map(collect);
        let mut stderr = child.stderr.take().map(collect);

        // The pipes stay open as long as any process in the group holds them,
        // so the drains count against the limit too.
        let finished = timeout(limit, async {
            let status = child.wait().await?;
            let stdout = drain(stdout.as_mut()).await?;
            let stderr = drain(stderr.as_mut()).await?;
            io::Result::Ok((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                abort_readers([&stdout, &stderr]);
                terminate(&mut child, &mut group, label).await;
                return CommandResult::unexpected(label, e);
            }
            Err(_) => {
                warn!(step = label, pid = ?group.pgid, ?limit, "timed out, killing");
                abort_readers([&stdout, &stderr]);
                terminate(&mut child, &mut group, label).await;
                return CommandResult::timed_out(label);
            }
        };

        debug!(
            step = label,
            code = ?status.code(),
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "process finished"
        );
        let body = merge_output(&stdout, &stderr);
        if status.success() {
            info!(step = label, "succeeded");
            CommandResult::succeeded(body)
        } else {
            info!(step = label, code = ?status.code(), "failed");
            CommandResult::failed(RunFailure::Exited { code: status.code() }, body)
        }
    }
}

fn command(program: &str, args: &[String]) -> Command {
    let mut cmd = std::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        cmd.process_group(0);
    }

    let mut cmd = Command::from(cmd);
    cmd.kill_on_drop(true);
    cmd
}

/// The process group a spawned step leads. Dropping it kills the group.
#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { pgid: child.id().filter(|&id| id > 0) }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            let Ok(pgid) = libc::pid_t::try_from(pgid) else {
                return;
            };
            // SAFETY: kill(2) only delivers a signal; a negative pid targets the group.
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc == -1 {
                debug!(pgid, error = %io::Error::last_os_error(), "process group already gone");
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn terminate(child: &mut Child, group: &mut ProcessGroup, label: &str) {
    group.kill();
    // Errors here only mean the child already exited and was reaped.
    if let Err(e) = child.start_kill() {
        debug!(step = label, error = %e, "child already exited");
    }
    if let Err(e) = child.wait().await {
        warn!(step = label, error = %e, "failed to reap killed process");
    }
}

type Reader = JoinHandle<io::Result<Vec<u8>>>;

fn collect<R>(mut stream: R) -> Reader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

fn abort_readers(readers: [&Option<Reader>; 2]) {
    for reader in readers.into_iter().flatten() {
        reader.abort();
    }
}

async fn drain(reader: Option<&mut Reader>) -> io::Result<String> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let bytes = reader.await.map_err(io::Error::other)??;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_keeps_stdout_first() {
        assert_eq!(merge_output("out", "err"), "out\nerr");
        assert_eq!(merge_output("out", ""), "out");
        assert_eq!(merge_output("", "err"), "err");
        assert_eq!(merge_output("", ""), "");
    }

    #[tokio::test]
    async fn captures_successful_output() {
        let result = ProcessRunner
            .run(&argv(&["echo", "hello"]), "EXECUTION", DEFAULT_TIMEOUT)
            .await;
        assert!(result.success);
        assert_eq!(result.combined_output, "hello\n");
        assert_eq!(result.failure, None);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure_with_captured_streams() {
        let result = ProcessRunner
            .run(&argv(&["sh", "-c", "echo out; echo err >&2; exit 3"]), "COMPILATION", DEFAULT_TIMEOUT)
            .await;
        assert!(!result.success);
        assert_eq!(result.combined_output, "out\n\nerr\n");
        assert_eq!(result.failure, Some(RunFailure::Exited { code: Some(3) }));
    }

    #[tokio::test]
    async fn missing_tool_names_the_command() {
        let result = ProcessRunner
            .run(&argv(&["definitely-not-a-real-compiler-xyz"]), "COMPILATION", DEFAULT_TIMEOUT)
            .await;
        assert!(!result.success);
        assert_eq!(
            result.combined_output,
            "COMPILATION failed! Command 'definitely-not-a-real-compiler-xyz' not found. Please install it."
        );
        assert!(matches!(result.failure, Some(RunFailure::ToolMissing { .. })));
    }

    #[tokio::test]
    async fn empty_argv_is_unexpected() {
        let result = ProcessRunner.run(&[], "EXECUTION", DEFAULT_TIMEOUT).await;
        assert!(!result.success);
        assert!(result.combined_output.starts_with("EXECUTION failed! Error:"));
        assert!(matches!(result.failure, Some(RunFailure::Unexpected { .. })));
    }

    /// Live means present in /proc and not a zombie awaiting its reaper.
    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid.trim())) else {
            return false;
        };
        let state = stat.rsplit(')').next().and_then(|rest| rest.trim_start().chars().next());
        !matches!(state, Some('Z' | 'X') | None)
    }

    #[cfg(target_os = "linux")]
    async fn eventually_gone(pid: &str) -> bool {
        for _ in 0..40 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_the_process_and_its_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let bg_file = dir.path().join("bg");
        let script = format!(
            "sleep 30 & echo $! > {}; echo $$ > {}; wait",
            bg_file.display(),
            pid_file.display()
        );
        let result = ProcessRunner
            .run(&argv(&["sh", "-c", script.as_str()]), "EXECUTION", Duration::from_millis(500))
            .await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(RunFailure::Timeout));
        assert_eq!(
            result.combined_output,
            "EXECUTION failed! Timeout: Process took too long to complete."
        );

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let bg = std::fs::read_to_string(&bg_file).unwrap();
        assert!(eventually_gone(&pid).await, "process {} still running", pid.trim());
        assert!(eventually_gone(&bg).await, "background job {} still running", bg.trim());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn background_job_holding_the_pipes_hits_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let bg_file = dir.path().join("bg");
        let script = format!("sleep 30 & echo $! > {}; exit 0", bg_file.display());

        let started = std::time::Instant::now();
        let result = ProcessRunner
            .run(&argv(&["sh", "-c", script.as_str()]), "EXECUTION", Duration::from_millis(500))
            .await;

        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        assert!(!result.success);
        assert_eq!(result.failure, Some(RunFailure::Timeout));

        let bg = std::fs::read_to_string(&bg_file).unwrap();
        assert!(eventually_gone(&bg).await, "background job {} still running", bg.trim());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn finished_step_leaves_no_detached_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let bg_file = dir.path().join("bg");
        let script = format!("sleep 30 >/dev/null 2>&1 & echo $! > {}; echo done", bg_file.display());

        let result = ProcessRunner
            .run(&argv(&["sh", "-c", script.as_str()]), "EXECUTION", DEFAULT_TIMEOUT)
            .await;
        assert!(result.success);
        assert_eq!(result.combined_output, "done\n");

        let bg = std::fs::read_to_string(&bg_file).unwrap();
        assert!(eventually_gone(&bg).await, "background job {} still running", bg.trim());
    }
}
