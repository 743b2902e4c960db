//! Handle for one external tool process.
//!
//! The child is owned by a reaper task that waits on it exactly once and
//! publishes the exit through a watch channel. Output capture tasks finish
//! before the exit is published, so a reader that observed termination
//! also sees the complete console text.
//!
//! On unix the child leads its own process group. Stop signals go to the
//! whole group, so helpers the tool started are stopped with it. Helpers
//! that outlive the tool and keep its output pipes open are killed once
//! the grace period passes.

use super::console::{Console, ConsoleBuffer};
use pagerun_shared::errors::{PagerunError, PagerunResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// Exit code, absent when terminated by a signal.
    pub code: Option<i32>,
    /// Terminating signal (Unix only).
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn into_result(self) -> PagerunResult<()> {
        if self.success() {
            Ok(())
        } else {
            Err(PagerunError::ProcessExit {
                code: self.code,
                signal: self.signal,
            })
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// State shared with the reaper and stop-escalation tasks.
struct Shared {
    exit: watch::Sender<Option<ProcessExit>>,
    force_kill: Notify,
    /// Set once a stop signal went out; the tool's group is not left behind.
    signalled: AtomicBool,
}

/// One external process invocation.
///
/// Created idle; [`ProcessHandle::start`] may be called once.
pub struct ProcessHandle {
    console: Console,
    capture: bool,
    grace_period: Duration,
    started: AtomicBool,
    stop_requested: AtomicBool,
    pid: Mutex<Option<u32>>,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &*self.pid.lock())
            .field("exit", &self.exit_status())
            .finish()
    }
}

impl Default for ProcessHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHandle {
    /// New idle handle with its own console and capture disabled.
    pub fn new() -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            console: Console::new(),
            capture: false,
            grace_period: DEFAULT_GRACE_PERIOD,
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            pid: Mutex::new(None),
            runtime: Mutex::new(None),
            shared: Arc::new(Shared {
                exit,
                force_kill: Notify::new(),
                signalled: AtomicBool::new(false),
            }),
        }
    }

    /// Write captured output into `console` instead of a private one.
    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Enable or disable stdout/stderr capture.
    pub fn with_console_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Time between the graceful stop signal and forced termination.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    /// Exit of the process, `None` while running or before start.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.shared.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.exit_status().is_none()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Launch `program` with `args`.
    ///
    /// With `wait_for_completion` the call returns after the process exited
    /// and its output was drained; otherwise once it has been spawned.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted` if this handle was started before
    /// - `Launch` if the program cannot be found or spawned
    pub async fn start(
        &self,
        program: &str,
        args: &[String],
        wait_for_completion: bool,
    ) -> PagerunResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PagerunError::AlreadyStarted);
        }

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if self.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|e| {
            let reason = e.to_string();
            tracing::error!(program = %program, error = %reason, "Failed to spawn process");
            self.console
                .err
                .push_line(&format!("failed to launch {}: {}", program, reason));
            PagerunError::Launch {
                program: program.to_string(),
                reason,
            }
        })?;

        let pid = child.id();
        *self.pid.lock() = pid;
        *self.runtime.lock() = Some(tokio::runtime::Handle::current());

        tracing::debug!(program = %program, pid = ?pid, args = ?args, "Spawned process");

        let mut captures = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            captures.push(spawn_capture(stdout, self.console.out.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            captures.push(spawn_capture(stderr, self.console.err.clone()));
        }

        tokio::spawn(reap(
            child,
            captures,
            Arc::clone(&self.shared),
            self.grace_period,
        ));

        if self.stop_requested() {
            tracing::debug!(pid = ?pid, "Stop was requested during start");
            self.signal_stop();
        }

        if wait_for_completion {
            self.wait().await?;
        }
        Ok(())
    }

    /// Wait until the process exited and its output was drained.
    pub async fn wait(&self) -> PagerunResult<ProcessExit> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(PagerunError::InvalidState("process not started".into()));
        }

        let mut rx = self.shared.exit.subscribe();
        wait_exit(&mut rx)
            .await
            .ok_or_else(|| PagerunError::Internal("process reaper vanished".into()))
    }

    /// Request termination: SIGTERM now, forced kill after the grace period.
    ///
    /// Idempotent. A no-op for the process itself when it already exited.
    /// A request made before or during `start` is honored as soon as the
    /// process is spawned.
    pub fn request_stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.started.load(Ordering::SeqCst) || self.exit_status().is_some() {
            tracing::debug!("Stop requested for process that is not running");
            return;
        }

        self.signal_stop();
    }

    fn signal_stop(&self) {
        self.shared.signalled.store(true, Ordering::SeqCst);
        #[cfg(unix)]
        {
            match self.pid() {
                // Still spawning; `start` signals once the PID is known
                None => {}
                Some(pid) if super::signal::is_process_alive(pid) => {
                    tracing::info!(pid = pid, "Sending SIGTERM to process group");
                    // The tool may have moved itself to another group
                    let delivered = super::signal::terminate_group(pid)
                        || super::signal::terminate_process(pid);
                    if delivered {
                        self.escalate_after_grace(pid);
                    } else {
                        tracing::warn!(pid = pid, "SIGTERM not delivered, forcing kill");
                        self.shared.force_kill.notify_one();
                    }
                }
                Some(_) => self.shared.force_kill.notify_one(),
            }
        }

        #[cfg(not(unix))]
        self.shared.force_kill.notify_one();
    }

    /// Force a kill if the process is still alive once the grace period ends.
    #[cfg(unix)]
    fn escalate_after_grace(&self, pid: u32) {
        let Some(runtime) = self.runtime.lock().clone() else {
            self.shared.force_kill.notify_one();
            return;
        };

        let shared = Arc::clone(&self.shared);
        let grace_period = self.grace_period;
        runtime.spawn(async move {
            let mut rx = shared.exit.subscribe();
            let timed_out = tokio::time::timeout(grace_period, wait_exit(&mut rx))
                .await
                .is_err();
            if timed_out {
                tracing::warn!(
                    pid = pid,
                    grace_ms = grace_period.as_millis() as u64,
                    "Process ignored SIGTERM, killing"
                );
                shared.force_kill.notify_one();
            }
        });
    }
}

/// Resolve once an exit has been published.
async fn wait_exit(rx: &mut watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    loop {
        if let Some(exit) = *rx.borrow_and_update() {
            return Some(exit);
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

fn spawn_capture<R>(stream: R, buffer: ConsoleBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => buffer.push_line(&String::from_utf8_lossy(&line)),
                Err(e) => {
                    tracing::debug!(error = %e, "Console capture ended");
                    break;
                }
            }
        }
    })
}

/// Wait for the child once, honoring forced kill requests, then drain output.
async fn reap(
    mut child: Child,
    captures: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    drain_limit: Duration,
) {
    let pgid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = shared.force_kill.notified() => {
            kill_process_group(pgid);
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "Failed to kill process");
            }
            child.wait().await
        }
    };

    if shared.signalled.load(Ordering::SeqCst) {
        kill_process_group(pgid);
    }
    drain(captures, pgid, &shared, drain_limit).await;

    let exit = match status {
        Ok(status) => ProcessExit::from(status),
        Err(e) => {
            tracing::error!(error = %e, "Failed to collect process status");
            ProcessExit {
                code: None,
                signal: None,
            }
        }
    };

    tracing::debug!(code = ?exit.code, signal = ?exit.signal, "Process exited");
    shared.exit.send_replace(Some(exit));
}

/// Wait for the capture tasks to reach end of stream.
///
/// Processes left behind by the tool can hold the pipes open after the tool
/// exited. Once `limit` passes, or a forced kill is requested, the group is
/// killed and capture stops with whatever was read so far.
async fn drain(
    captures: Vec<JoinHandle<()>>,
    pgid: Option<u32>,
    shared: &Shared,
    limit: Duration,
) {
    let aborts: Vec<_> = captures.iter().map(|capture| capture.abort_handle()).collect();
    let all = futures::future::join_all(captures);
    tokio::pin!(all);

    let drained = tokio::select! {
        _ = &mut all => true,
        _ = tokio::time::sleep(limit) => false,
        _ = shared.force_kill.notified() => false,
    };

    if !drained {
        tracing::warn!(
            pgid = ?pgid,
            "Output still open after process exit, killing process group"
        );
        kill_process_group(pgid);
        for abort in aborts {
            abort.abort();
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        super::signal::kill_group(pgid);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_output_in_order() {
        let handle = ProcessHandle::new().with_console_capture(true);
        handle
            .start(
                "sh",
                &args(&["-c", "echo one; echo two; echo oops >&2"]),
                true,
            )
            .await
            .unwrap();

        assert_eq!(handle.console().out.snapshot(), "one\ntwo\n");
        assert_eq!(handle.console().err.snapshot(), "oops\n");
        assert!(handle.exit_status().unwrap().success());
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_capture_disabled_keeps_console_empty() {
        let handle = ProcessHandle::new();
        handle
            .start("sh", &args(&["-c", "echo ignored"]), true)
            .await
            .unwrap();
        assert!(handle.console().out.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let handle = ProcessHandle::new();
        handle
            .start("sh", &args(&["-c", "exit 3"]), false)
            .await
            .unwrap();
        let exit = handle.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(matches!(
            exit.into_result(),
            Err(PagerunError::ProcessExit { code: Some(3), .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let handle = ProcessHandle::new().with_console_capture(true);
        let result = handle
            .start("/nonexistent/pagerun-tool", &[], false)
            .await;
        assert!(matches!(result, Err(PagerunError::Launch { .. })));
        assert!(handle.console().err.snapshot().contains("failed to launch"));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let handle = ProcessHandle::new();
        handle.start("true", &[], true).await.unwrap();
        let result = handle.start("true", &[], true).await;
        assert!(matches!(result, Err(PagerunError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_request_stop_terminates() {
        let handle = ProcessHandle::new();
        handle.start("sleep", &args(&["30"]), false).await.unwrap();
        assert!(handle.is_running());
        let pid = handle.pid().unwrap();

        let started = Instant::now();
        handle.request_stop();
        handle.request_stop();
        let exit = handle.wait().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!exit.success());
        assert_eq!(exit.signal, Some(libc::SIGTERM));
        assert!(!crate::process::signal::is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_stop_escalates_after_grace_period() {
        let handle = ProcessHandle::new().with_grace_period(Duration::from_millis(200));
        handle
            .start(
                "sh",
                &args(&["-c", "trap '' TERM; while true; do sleep 0.1; done"]),
                false,
            )
            .await
            .unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        handle.request_stop();
        let exit = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_request_stop_reaches_children_of_the_tool() {
        let handle = ProcessHandle::new()
            .with_console_capture(true)
            .with_grace_period(Duration::from_millis(500));
        // The shell forks `sleep` instead of exec'ing it
        handle
            .start("sh", &args(&["-c", "sleep 20; true"]), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        handle.request_stop();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("stop did not reach the forked child")
            .unwrap();

        assert!(!exit.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_leftover_children_do_not_hold_exit() {
        let handle = ProcessHandle::new()
            .with_console_capture(true)
            .with_grace_period(Duration::from_millis(300));
        handle
            .start("sh", &args(&["-c", "sleep 20 & echo started"]), false)
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("background child kept the process open")
            .unwrap();

        assert!(exit.success());
        assert_eq!(handle.console().out.snapshot(), "started\n");
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let handle = ProcessHandle::new();
        handle.request_stop();
        assert!(handle.stop_requested());
        assert!(handle.exit_status().is_none());
        assert!(handle.wait().await.is_err());
    }
}
