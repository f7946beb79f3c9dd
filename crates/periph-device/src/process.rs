//! External process plumbing shared by the capture backends.
//!
//! [`ProcessSupervisor`] owns long-running ffmpeg children. Each child gets a
//! monitor task that either sees it exit on its own (and reports through the
//! session's [`EventSink`]) or receives a stop request, asks ffmpeg to quit by
//! writing `q` to its stdin, and kills it after the grace period.

use parking_lot::Mutex;
use periph_core::{PeriphError, Result, SessionId};
use periph_session::{BackendHandle, BackendStatus, EventSink, HandleId};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// How long a freshly spawned child must survive to count as started.
const STARTUP_PROBE: Duration = Duration::from_millis(500);

/// Lines of stderr kept for error messages.
const STDERR_TAIL: usize = 8;

/// How a supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSummary {
    pub success: bool,
    /// Set when the exit was asked for through [`ProcessSupervisor::stop`].
    pub requested: bool,
    pub detail: Option<String>,
}

struct Supervised {
    status: BackendStatus,
    stop_tx: Option<oneshot::Sender<()>>,
    done: watch::Receiver<Option<ExitSummary>>,
}

type Table = Arc<Mutex<HashMap<HandleId, Supervised>>>;

/// Spawns and stops long-running children of one program.
#[derive(Clone)]
pub struct ProcessSupervisor {
    program: String,
    grace: Duration,
    table: Table,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<String>, grace: Duration) -> Self {
        Self {
            program: program.into(),
            grace,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Spawn `program args...` for a session.
    ///
    /// Returns once the child has survived the startup probe. A child that
    /// dies inside the probe window with a failure status is reported as a
    /// start error carrying its stderr. `output`, when given, must exist and
    /// be non-empty after a successful exit.
    pub async fn spawn(
        &self,
        label: &str,
        args: &[String],
        session_id: SessionId,
        sink: EventSink,
        output: Option<PathBuf>,
    ) -> Result<BackendHandle> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, ?args, "spawning");
        let mut child = cmd.spawn().map_err(|e| spawn_error(&self.program, e))?;

        let handle = BackendHandle::new(label);
        let handle_id = handle.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, mut done_rx) = watch::channel(None);

        {
            let mut table = self.table.lock();
            table.retain(|_, s| s.status == BackendStatus::Running);
            table.insert(
                handle_id,
                Supervised {
                    status: BackendStatus::Running,
                    stop_tx: Some(stop_tx),
                    done: done_rx.clone(),
                },
            );
        }

        // Stops the child if this future is dropped before it returns.
        let mut guard = SpawnGuard {
            table: self.table.clone(),
            handle_id,
            armed: true,
        };

        let stderr_tail = collect_stderr(&mut child);
        let monitor = Monitor {
            table: self.table.clone(),
            handle_id,
            session_id,
            sink,
            grace: self.grace,
            output,
        };
        tokio::spawn(monitor.run(child, stop_rx, stderr_tail, done_tx));

        let early_exit: Option<ExitSummary> =
            match tokio::time::timeout(STARTUP_PROBE, done_rx.wait_for(Option::is_some)).await {
                Ok(Ok(summary)) => summary.clone(),
                _ => None,
            };

        match early_exit {
            Some(summary) if !summary.success => {
                drop(guard);
                Err(PeriphError::backend(format!(
                    "{} failed to start: {}",
                    self.program,
                    summary.detail.unwrap_or_else(|| "exited immediately".into())
                )))
            }
            // Finished inside the probe (very short recording); the
            // completion has already gone through the sink.
            Some(_) => {
                guard.armed = false;
                Ok(handle)
            }
            None => {
                guard.armed = false;
                info!(handle = %handle_id, label, "process running");
                Ok(handle)
            }
        }
    }

    /// Ask the child to quit and wait for it to exit.
    pub async fn stop(&self, handle: BackendHandle) -> Result<ExitSummary> {
        let handle_id = handle.id();
        let (stop_tx, mut done) = {
            let mut table = self.table.lock();
            let Some(entry) = table.get_mut(&handle_id) else {
                return Err(PeriphError::backend(format!(
                    "{} is not a supervised process",
                    handle.label()
                )));
            };
            (entry.stop_tx.take(), entry.done.clone())
        };

        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        let summary = match done.wait_for(Option::is_some).await {
            Ok(summary) => summary.clone().unwrap_or(ExitSummary {
                success: false,
                requested: true,
                detail: None,
            }),
            Err(_) => ExitSummary {
                success: false,
                requested: true,
                detail: Some("monitor task ended without a result".into()),
            },
        };
        self.table.lock().remove(&handle_id);
        Ok(summary)
    }

    /// Stop the child and turn an unclean exit into a backend error.
    pub async fn stop_checked(&self, handle: BackendHandle) -> Result<()> {
        let summary = self.stop(handle).await?;
        if summary.success {
            Ok(())
        } else {
            Err(PeriphError::backend(
                summary
                    .detail
                    .unwrap_or_else(|| format!("{} did not exit cleanly", self.program)),
            ))
        }
    }

    pub fn poll(&self, handle: HandleId) -> BackendStatus {
        self.table
            .lock()
            .get(&handle)
            .map(|s| s.status.clone())
            .unwrap_or(BackendStatus::Unknown)
    }

    /// Children still running.
    pub fn running(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|s| s.status == BackendStatus::Running)
            .count()
    }
}

struct SpawnGuard {
    table: Table,
    handle_id: HandleId,
    armed: bool,
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let entry = self.table.lock().remove(&self.handle_id);
        if let Some(tx) = entry.and_then(|mut e| e.stop_tx.take()) {
            debug!(handle = %self.handle_id, "start abandoned, stopping process");
            let _ = tx.send(());
        }
    }
}

struct Monitor {
    table: Table,
    handle_id: HandleId,
    session_id: SessionId,
    sink: EventSink,
    grace: Duration,
    output: Option<PathBuf>,
}

impl Monitor {
    async fn run(
        self,
        mut child: Child,
        stop_rx: oneshot::Receiver<()>,
        stderr_tail: tokio::task::JoinHandle<String>,
        done_tx: watch::Sender<Option<ExitSummary>>,
    ) {
        let (status, requested) = tokio::select! {
            status = child.wait() => (status, false),
            _ = stop_rx => (self.quit(&mut child).await, true),
        };
        let stderr = stderr_tail.await.unwrap_or_default();

        let summary = match status {
            Ok(status) => summarize(status, requested, &stderr, self.output.as_deref()),
            Err(e) => ExitSummary {
                success: false,
                requested,
                detail: Some(format!("failed to wait for process: {e}")),
            },
        };

        if let Some(entry) = self.table.lock().get_mut(&self.handle_id) {
            entry.status = BackendStatus::Exited {
                success: summary.success,
                detail: summary.detail.clone(),
            };
        }

        if !requested {
            let reported = if summary.success {
                self.sink.completed(self.session_id)
            } else {
                let detail = summary
                    .detail
                    .clone()
                    .unwrap_or_else(|| "process exited with an error".into());
                self.sink.failed(self.session_id, detail)
            };
            if !reported {
                debug!(session.id = %self.session_id, "engine gone, exit not reported");
            }
        }
        info!(handle = %self.handle_id, success = summary.success, requested, "process exited");
        let _ = done_tx.send(Some(summary));
    }

    /// `q` on stdin, then kill after the grace period.
    async fn quit(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                debug!(handle = %self.handle_id, error = %e, "could not write quit command");
            }
            drop(stdin);
        }
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(handle = %self.handle_id, grace_secs = self.grace.as_secs(), "process ignored quit, killing");
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

fn summarize(status: ExitStatus, requested: bool, stderr: &str, output: Option<&Path>) -> ExitSummary {
    if !status.success() {
        let detail = match stderr.trim() {
            "" => format!("process exited with {status}"),
            tail => format!("process exited with {status}: {tail}"),
        };
        return ExitSummary {
            success: false,
            requested,
            detail: Some(detail),
        };
    }
    if let Some(path) = output {
        let valid = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        if !valid {
            return ExitSummary {
                success: false,
                requested,
                detail: Some(format!("no valid file was created at {}", path.display())),
            };
        }
    }
    ExitSummary {
        success: true,
        requested,
        detail: None,
    }
}

/// Drain stderr in the background, keeping the last few lines.
fn collect_stderr(child: &mut Child) -> tokio::task::JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let Some(stderr) = stderr else {
            return String::new();
        };
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

/// Run a short-lived command to completion, whatever its exit status.
pub async fn run_output(program: &str, args: &[String], limit: Duration) -> Result<Output> {
    debug!(program, ?args, "running");
    tokio::time::timeout(limit, Command::new(program).args(args).output())
        .await
        .map_err(|_| PeriphError::Timeout {
            operation: format!("{program} {}", args.join(" ")),
            after_secs: limit.as_secs(),
        })?
        .map_err(|e| spawn_error(program, e))
}

/// Run a short-lived command and return its stdout.
pub async fn run_command(program: &str, args: &[String], limit: Duration) -> Result<String> {
    let output = run_output(program, args, limit).await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PeriphError::backend(format!(
            "{program} failed ({}): {}",
            output.status,
            stderr.trim()
        )))
    }
}

/// Run a command for its stderr, ignoring the exit status. ffmpeg's
/// `-list_devices` prints there and always exits non-zero.
pub async fn run_for_stderr(program: &str, args: &[String], limit: Duration) -> Result<String> {
    let output = run_output(program, args, limit).await?;
    Ok(String::from_utf8_lossy(&output.stderr).to_string())
}

pub(crate) fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn spawn_error(program: &str, e: std::io::Error) -> PeriphError {
    if e.kind() == std::io::ErrorKind::NotFound {
        PeriphError::backend(format!(
            "{program} not found. Install it using: {}",
            install_hint(program)
        ))
    } else {
        PeriphError::backend(format!("failed to run {program}: {e}"))
    }
}

fn install_hint(program: &str) -> String {
    let name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    match (name, std::env::consts::OS) {
        ("ffmpeg", "macos") => "brew install ffmpeg".into(),
        ("ffmpeg", "windows") => "winget install ffmpeg  OR  download from https://ffmpeg.org/".into(),
        ("ffmpeg", _) => "sudo apt install ffmpeg  OR  sudo yum install ffmpeg".into(),
        ("lp" | "lpstat" | "cancel", "macos") => "CUPS ships with macOS; check that it is enabled".into(),
        ("lp" | "lpstat" | "cancel", _) => "sudo apt install cups-client".into(),
        ("xrandr", _) => "sudo apt install x11-xserver-utils".into(),
        _ => format!("install {name} and make sure it is on PATH"),
    }
}
