//! External command execution.
//!
//! A nonzero exit is data, not an error: [`CommandRunner::run`] only fails
//! when the program cannot be started at all.

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;

/// Captured output is capped per stream; `pip install -vvv` is chatty.
const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(2);

pub type RunFut<'a> = Pin<Box<dyn Future<Output = Result<CommandOutput, RunError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One external program call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Added to the inherited environment.
    pub env: Vec<(OsString, OsString)>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set `PYTHONPATH` when `dir` is given.
    #[must_use]
    pub fn python_path(self, dir: Option<&Path>) -> Self {
        match dir {
            Some(dir) => self.env("PYTHONPATH", dir),
            None => self,
        }
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Space-joined command line, for logs and test matching.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Terminating signal, Unix only.
    pub signal: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code zero and no terminating signal.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFut<'a>;
}

/// Runs commands as tokio child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFut<'a> {
        Box::pin(run_process(invocation))
    }
}

async fn run_process(invocation: &Invocation) -> Result<CommandOutput, RunError> {
    tracing::info!(target: "gx::command", command = %invocation.command_line(), "Running");

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &invocation.cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    set_new_session(&mut cmd);

    let child = cmd.spawn().map_err(|source| {
        tracing::error!(
            target: "gx::command",
            program = %invocation.program.display(),
            "Spawn failed: {source}"
        );
        RunError::Spawn {
            program: invocation.program.clone(),
            source,
        }
    })?;

    let mut child = GroupGuard::new(child);
    let stdout_task = child
        .child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(read_to_end_limited(stdout, MAX_OUTPUT_BYTES)));
    let stderr_task = child
        .child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_to_end_limited(stderr, MAX_OUTPUT_BYTES)));

    let mut timed_out = false;
    let status = match invocation.timeout {
        None => child.child.wait().await.ok(),
        Some(limit) => {
            if let Ok(res) = time::timeout(limit, child.child.wait()).await {
                res.ok()
            } else {
                timed_out = true;
                tracing::warn!(
                    target: "gx::command",
                    command = %invocation.command_line(),
                    timeout_ms = limit.as_millis() as u64,
                    "Timed out, killing"
                );
                child.kill_group();
                time::timeout(KILL_GRACE, child.child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok)
            }
        }
    };
    child.disarm();

    // A lingering descendant can still hold the pipes open.
    let stdout = collect(stdout_task, KILL_GRACE).await;
    let stderr = collect(stderr_task, KILL_GRACE).await;

    let output = CommandOutput {
        stdout,
        stderr,
        exit_code: status.and_then(|s| s.code()),
        signal: status.and_then(exit_signal),
        timed_out,
    };

    tracing::info!(
        target: "gx::command",
        command = %invocation.command_line(),
        exit_code = ?output.exit_code,
        signal = ?output.signal,
        timed_out = output.timed_out,
        "Finished"
    );
    tracing::debug!(target: "gx::command", stdout = %output.stdout, stderr = %output.stderr);

    Ok(output)
}

/// Kills the child's whole process group on drop unless disarmed, so a
/// cancelled or timed-out run leaves no descendants behind.
struct GroupGuard {
    child: Child,
    armed: bool,
}

impl GroupGuard {
    fn new(child: Child) -> Self {
        Self { child, armed: true }
    }

    fn kill_group(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id()
            && let Ok(pgid) = libc::pid_t::try_from(pid)
        {
            // SAFETY: killpg takes plain integers and touches no memory.
            if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
                return;
            }
        }
        let _ = self.child.start_kill();
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.kill_group();
        }
    }
}

/// Start the child as the leader of a new session so `killpg` reaches
/// everything it spawns.
#[cfg(unix)]
fn set_new_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid is async-signal-safe and the closure allocates nothing.
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(unix)]
fn exit_signal(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: std::process::ExitStatus) -> Option<i32> {
    None
}

async fn collect(task: Option<JoinHandle<(Vec<u8>, bool)>>, grace: Duration) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    let (bytes, truncated) = match time::timeout(grace, &mut task).await {
        Ok(joined) => joined.unwrap_or_else(|_| (Vec::new(), false)),
        Err(_) => {
            task.abort();
            tracing::warn!(target: "gx::command", "Output pipe still open after exit, dropping it");
            (Vec::new(), false)
        }
    };
    if truncated {
        tracing::warn!(target: "gx::command", "Output truncated at {MAX_OUTPUT_BYTES} bytes");
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn read_to_end_limited<R: tokio::io::AsyncRead + Unpin + Send + 'static>(
    mut reader: R,
    max_bytes: usize,
) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            // Keep draining so the child never blocks on a full pipe.
            truncated = true;
            continue;
        }
        let take = remaining.min(n);
        buf.extend_from_slice(&tmp[..take]);
        if take < n {
            truncated = true;
        }
    }

    (buf, truncated)
}
