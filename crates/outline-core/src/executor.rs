//! Runs one external command to completion while streaming its output.
//!
//! stdout and stderr are drained by independent reader tasks. Lines from
//! one stream arrive in the order the child wrote them; lines from the two
//! streams are not strictly interleaved relative to each other.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A program plus arguments, e.g. `bash .outline/build.sh`.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl StageCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Interpreter invocation of a script path relative to the working directory.
    pub fn script(interpreter: &str, script: impl Into<PathBuf>) -> Self {
        Self::new(interpreter).arg(script.into().to_string_lossy().into_owned())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Process exit code; -1 when killed by a signal or on timeout.
    pub exit_code: i32,
    /// Every captured line, stdout and stderr merged in arrival order.
    pub lines: Vec<String>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StageExecutor {
    timeout: Option<Duration>,
}

impl StageExecutor {
    /// `timeout_s == 0` disables the timeout.
    pub fn new(timeout_s: u64) -> Self {
        Self {
            timeout: (timeout_s > 0).then(|| Duration::from_secs(timeout_s)),
        }
    }

    pub fn timeout_s(&self) -> u64 {
        self.timeout.map(|d| d.as_secs()).unwrap_or(0)
    }

    /// Run `cmd` in `dir`, handing each output line to `on_line` as it arrives.
    ///
    /// A non-zero exit is reported in the outcome, not as an error; only a
    /// missing working directory or a failure to spawn is an `Err`. The
    /// result is decided by the child's own exit; on timeout its whole
    /// process group is killed and the outcome has `timed_out` set.
    pub async fn execute(
        &self,
        cmd: &StageCommand,
        dir: &Path,
        on_line: &mut (dyn FnMut(StreamKind, &str) + Send),
    ) -> std::io::Result<ExecOutcome> {
        if !dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("working directory {} does not exist", dir.display()),
            ));
        }

        let start = Instant::now();
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(dir)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout takes down everything the stage started.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;
        let pgid = child.id();

        debug!(command = %cmd.display(), dir = %dir.display(), pid = ?pgid, "spawned stage process");

        let (tx, mut rx) = mpsc::unbounded_channel::<(StreamKind, String)>();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(stdout, StreamKind::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(stderr, StreamKind::Stderr, tx.clone())));
        }
        drop(tx);

        let deadline = self.timeout.map(|d| tokio::time::Instant::now() + d);
        let mut lines = Vec::new();
        let mut streams_open = true;

        let exit = loop {
            tokio::select! {
                msg = rx.recv(), if streams_open => match msg {
                    Some((kind, line)) => {
                        on_line(kind, &line);
                        lines.push(line);
                    }
                    None => streams_open = false,
                },
                status = child.wait() => break Some(status?),
                _ = sleep_until(deadline) => break None,
            }
        };

        let (exit_code, timed_out) = match exit {
            Some(status) => {
                // Background jobs left behind must not outlive the stage.
                kill_group(pgid);
                (status.code().unwrap_or(-1), false)
            }
            None => {
                warn!(
                    command = %cmd.display(),
                    timeout_s = self.timeout_s(),
                    "stage process timed out, killing process group"
                );
                terminate(&mut child, pgid).await;
                (-1, true)
            }
        };

        // Pick up output still buffered in the pipes, then stop the readers
        // even if something outside the group still holds them open.
        let grace = tokio::time::Instant::now() + READER_GRACE;
        while streams_open {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some((kind, line)) => {
                        on_line(kind, &line);
                        lines.push(line);
                    }
                    None => streams_open = false,
                },
                _ = tokio::time::sleep_until(grace) => break,
            }
        }
        for reader in readers {
            reader.abort();
        }

        Ok(ExecOutcome {
            exit_code,
            lines,
            timed_out,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

const READER_GRACE: Duration = Duration::from_secs(2);
const KILL_GRACE: Duration = Duration::from_secs(5);

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    use nix::{errno::Errno, unistd::Pid};
    match nix::sys::signal::killpg(Pid::from_raw(pgid as i32), signal) {
        Err(Errno::ESRCH) => Ok(()),
        other => other,
    }
}

/// SIGKILL whatever is left in the stage's process group.
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        if let Err(e) = signal_group(pgid, nix::sys::signal::Signal::SIGKILL) {
            warn!(pgid, "failed to kill stage process group: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

/// SIGTERM the group, give it `KILL_GRACE` to exit, then SIGKILL it.
async fn terminate(child: &mut tokio::process::Child, pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        if let Err(e) = signal_group(pgid, nix::sys::signal::Signal::SIGTERM) {
            warn!(pgid, "SIGTERM to stage process group failed: {e}");
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            warn!(pgid, "stage process ignored SIGTERM");
        }
        kill_group(Some(pgid));
    }
    if let Err(e) = child.kill().await {
        debug!("stage process already gone: {e}");
    }
}

async fn pump_lines<R>(stream: R, kind: StreamKind, tx: mpsc::UnboundedSender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send((kind, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("error reading {kind:?}: {e}");
                break;
            }
        }
    }
}
