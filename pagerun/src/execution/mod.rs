//! One run of one pipeline stage over a set of pages.
//!
//! A [`StageExecution`] is the observable record of a run: state, progress,
//! console output and the process currently doing the work. The work itself
//! is driven by [`lifecycle::run`] on a spawned task.

pub(crate) mod lifecycle;
mod state;
pub mod tasks;

pub use state::ExecutionState;

use crate::layout::ProjectLayout;
use crate::process::{Console, ConsoleStream, ProcessExit, ProcessHandle};
use crate::progress::Progress;
use crate::registry::SessionId;
use crate::stage::PipelineStage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Unique execution identifier (ULID).
pub type ExecutionId = String;

/// Point-in-time view of an execution, suitable for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionInfo {
    pub id: ExecutionId,
    pub session: SessionId,
    pub stage: PipelineStage,
    pub pages: Vec<String>,
    pub project: PathBuf,
    pub state: ExecutionState,
    pub progress: i32,
    pub cancel_requested: bool,
    pub in_pipeline_flow: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit: Option<ProcessExit>,
    pub error: Option<String>,
}

/// Record of a single stage run.
pub struct StageExecution {
    id: ExecutionId,
    session: SessionId,
    stage: PipelineStage,
    pages: Vec<String>,
    layout: ProjectLayout,
    in_pipeline_flow: bool,
    created_at: DateTime<Utc>,
    state: watch::Sender<ExecutionState>,
    progress: Progress,
    console: Console,
    cancel_requested: AtomicBool,
    process: Mutex<Option<Arc<ProcessHandle>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    exit: Mutex<Option<ProcessExit>>,
    error: Mutex<Option<String>>,
}

impl std::fmt::Debug for StageExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecution")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("stage", &self.stage)
            .field("state", &self.state())
            .field("progress", &self.progress.get())
            .finish()
    }
}

impl StageExecution {
    pub(crate) fn new(
        session: SessionId,
        stage: PipelineStage,
        pages: Vec<String>,
        layout: ProjectLayout,
        in_pipeline_flow: bool,
    ) -> Self {
        let (state, _) = watch::channel(ExecutionState::Idle);
        Self {
            id: ulid::Ulid::new().to_string(),
            session,
            stage,
            pages,
            layout,
            in_pipeline_flow,
            created_at: Utc::now(),
            state,
            progress: Progress::new(),
            console: Console::new(),
            cancel_requested: AtomicBool::new(false),
            process: Mutex::new(None),
            finished_at: Mutex::new(None),
            exit: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn pages(&self) -> &[String] {
        &self.pages
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn in_pipeline_flow(&self) -> bool {
        self.in_pipeline_flow
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.borrow()
    }

    /// Current progress, `-1` when unknown or after a failed or cancelled run.
    pub fn progress(&self) -> i32 {
        self.progress.get()
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Accumulated output of one console stream.
    pub fn console_output(&self, stream: ConsoleStream) -> String {
        self.console.stream(stream).snapshot()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Reason for a `Failed` outcome.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Exit of the last tool process, once it terminated.
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit.lock()
    }

    /// Ask the execution to stop.
    ///
    /// Sets the cancel latch and forwards the request to the running
    /// process. Returns `false` and does nothing when the execution is not
    /// running, so cancelling before start or after termination is harmless.
    pub fn cancel(&self) -> bool {
        if !self.state().can_cancel() {
            tracing::debug!(
                execution_id = %self.id,
                stage = %self.stage,
                state = %self.state(),
                "Cancel ignored, execution not running"
            );
            return false;
        }

        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return true;
        }

        tracing::info!(
            execution_id = %self.id,
            session = %self.session,
            stage = %self.stage,
            "Cancelling execution"
        );

        let process = self.process.lock().clone();
        if let Some(process) = process {
            process.request_stop();
        }
        true
    }

    /// Set progress back to the sentinel.
    pub fn reset_progress(&self) {
        self.progress.reset();
    }

    /// Wait for a terminal state and return it.
    pub async fn wait(&self) -> ExecutionState {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    pub fn info(&self) -> ExecutionInfo {
        ExecutionInfo {
            id: self.id.clone(),
            session: self.session.clone(),
            stage: self.stage,
            pages: self.pages.clone(),
            project: self.layout.root().to_path_buf(),
            state: self.state(),
            progress: self.progress.get(),
            cancel_requested: self.cancel_requested(),
            in_pipeline_flow: self.in_pipeline_flow,
            created_at: self.created_at,
            finished_at: *self.finished_at.lock(),
            exit: self.exit(),
            error: self.error(),
        }
    }

    /// Idle to Running; progress becomes 0.
    pub(crate) fn begin(&self) -> bool {
        let moved = self.transition(ExecutionState::Running);
        if moved {
            self.progress.start();
        }
        moved
    }

    pub(crate) fn progress_handle(&self) -> &Progress {
        &self.progress
    }

    /// Make `process` the target of cancel requests.
    ///
    /// Returns `false` if cancellation was already requested; the caller
    /// must not start the process then.
    pub(crate) fn attach_process(&self, process: Arc<ProcessHandle>) -> bool {
        *self.process.lock() = Some(process);
        !self.cancel_requested()
    }

    pub(crate) fn record_exit(&self, exit: ProcessExit) {
        *self.exit.lock() = Some(exit);
    }

    /// Move to a terminal state. Progress must already hold its final value.
    pub(crate) fn finish(&self, state: ExecutionState, error: Option<String>) -> bool {
        debug_assert!(state.is_terminal());
        if let Some(error) = error {
            *self.error.lock() = Some(error);
        }
        *self.finished_at.lock() = Some(Utc::now());
        self.transition(state)
    }

    fn transition(&self, next: ExecutionState) -> bool {
        let id = &self.id;
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                tracing::warn!(
                    execution_id = %id,
                    from = %current,
                    to = %next,
                    "Rejected state transition"
                );
                return false;
            }
            tracing::debug!(execution_id = %id, from = %current, to = %next, "State transition");
            *current = next;
            true
        })
    }
}
