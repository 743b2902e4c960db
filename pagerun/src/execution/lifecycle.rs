//! Drives one stage execution from acceptance to its terminal state.
//!
//! Order of work:
//! 1. check inputs, create directories, delete stale outputs
//! 2. run each invocation, sampling progress while it runs
//! 3. post-process, then report 100
//!
//! Any error moves the execution to `Failed`; a cancel request observed at
//! a checkpoint or through the process exit moves it to `Cancelled`. Both
//! reset progress to the sentinel. The registry entry is released in every
//! case, including a panic inside a task.

use super::tasks::{Invocation, StageTask, remove_stale_outputs};
use super::{ExecutionState, StageExecution};
use crate::metrics::EngineMetricsStorage;
use crate::options::EngineOptions;
use crate::process::{ProcessExit, ProcessHandle};
use crate::progress::{ProgressSource, percent};
use crate::registry::ExecutionRegistry;
use pagerun_shared::errors::{PagerunError, PagerunResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Engine state an execution task needs.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub registry: ExecutionRegistry,
    pub metrics: Arc<EngineMetricsStorage>,
    pub options: Arc<EngineOptions>,
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(PagerunError),
}

/// Finalizes the execution as failed if dropped while still armed.
struct FinishGuard<'a> {
    execution: &'a Arc<StageExecution>,
    ctx: &'a RunContext,
    started: Instant,
    armed: bool,
}

impl<'a> FinishGuard<'a> {
    fn new(execution: &'a Arc<StageExecution>, ctx: &'a RunContext) -> Self {
        Self {
            execution,
            ctx,
            started: Instant::now(),
            armed: true,
        }
    }

    fn finish(mut self, outcome: Outcome) {
        self.armed = false;
        finish(self.execution, self.ctx, outcome, self.started.elapsed());
    }
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!(
                execution_id = %self.execution.id(),
                stage = %self.execution.stage(),
                "Execution task ended without a result"
            );
            finish(
                self.execution,
                self.ctx,
                Outcome::Failed(PagerunError::Internal("execution aborted".into())),
                self.started.elapsed(),
            );
        }
    }
}

/// Run `task` for `execution`, which must already be `Running`.
pub(crate) async fn run(execution: Arc<StageExecution>, task: Box<dyn StageTask>, ctx: RunContext) {
    let guard = FinishGuard::new(&execution, &ctx);

    tracing::info!(
        execution_id = %execution.id(),
        session = %execution.session(),
        stage = %execution.stage(),
        pages = execution.pages().len(),
        project = %execution.layout().root().display(),
        "Starting stage execution"
    );

    let outcome = match drive(&execution, task.as_ref(), &ctx).await {
        Ok(outcome) => outcome,
        Err(e) => Outcome::Failed(e),
    };
    guard.finish(outcome);
}

async fn drive(
    execution: &StageExecution,
    task: &dyn StageTask,
    ctx: &RunContext,
) -> PagerunResult<Outcome> {
    let layout = execution.layout();
    let pages = execution.pages();
    let stage = execution.stage();

    task.check_inputs(layout, pages)?;
    layout.prepare(stage)?;
    remove_stale_outputs(layout, stage, pages).await?;
    task.prepare(layout, pages).await?;

    let tool = ctx.options.tools.for_stage(stage);
    let invocations = task.invocations(tool, layout, pages)?;
    let source = task.progress_source(layout, pages);
    let total = invocations.len();

    for (index, invocation) in invocations.iter().enumerate() {
        if execution.cancel_requested() {
            return Ok(Outcome::Cancelled);
        }

        let Some(exit) = run_invocation(execution, invocation, &source, ctx).await? else {
            return Ok(Outcome::Cancelled);
        };
        if execution.cancel_requested() {
            return Ok(Outcome::Cancelled);
        }
        exit.into_result()?;

        if let ProgressSource::PerInvocation { cap } = source {
            execution
                .progress_handle()
                .advance(percent(index + 1, total, cap));
        }
    }

    if execution.cancel_requested() {
        return Ok(Outcome::Cancelled);
    }

    // Pages the tool skipped silently would otherwise hold progress low
    execution.progress_handle().advance(source.cap());
    task.post_process(layout, pages).await?;
    Ok(Outcome::Completed)
}

/// Spawn one process and wait for it. `None` when cancelled before spawn.
async fn run_invocation(
    execution: &StageExecution,
    invocation: &Invocation,
    source: &ProgressSource,
    ctx: &RunContext,
) -> PagerunResult<Option<ProcessExit>> {
    let handle = Arc::new(
        ProcessHandle::new()
            .with_console(execution.console().clone())
            .with_console_capture(ctx.options.capture_console)
            .with_grace_period(ctx.options.stop_grace_period()),
    );
    if !execution.attach_process(Arc::clone(&handle)) {
        return Ok(None);
    }

    tracing::debug!(
        execution_id = %execution.id(),
        program = %invocation.program,
        page = ?invocation.page,
        "Running tool"
    );
    handle
        .start(&invocation.program, &invocation.args, false)
        .await?;

    // Interval is validated non-zero by the engine
    let mut ticker = tokio::time::interval(ctx.options.progress_poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            exit = handle.wait() => break exit,
            _ = ticker.tick() => {
                let value = source.sample(execution.pages());
                execution.progress_handle().advance(value);
            }
        }
    };

    let exit = match exit {
        Ok(exit) => exit,
        Err(e) => {
            handle.request_stop();
            return Err(e);
        }
    };

    tracing::debug!(
        execution_id = %execution.id(),
        program = %invocation.program,
        exit_code = ?exit.code,
        signal = ?exit.signal,
        "Tool exited"
    );
    execution.record_exit(exit);
    Ok(Some(exit))
}

fn finish(execution: &Arc<StageExecution>, ctx: &RunContext, outcome: Outcome, elapsed: Duration) {
    let progress = execution.progress_handle();
    let (state, failure) = match outcome {
        Outcome::Completed => {
            progress.complete();
            (ExecutionState::Completed, None)
        }
        Outcome::Cancelled => {
            progress.reset();
            (ExecutionState::Cancelled, None)
        }
        Outcome::Failed(e) => {
            execution
                .console()
                .err
                .push_line(&format!("{} failed: {}", execution.stage(), e));
            progress.reset();
            (ExecutionState::Failed, Some((e.kind(), e.to_string())))
        }
    };

    let error = failure.as_ref().map(|(_, message)| message.clone());
    if execution.finish(state, error) {
        ctx.metrics.record_finished(state);
    }

    match &failure {
        Some((kind, message)) => tracing::warn!(
            execution_id = %execution.id(),
            stage = %execution.stage(),
            duration_ms = elapsed.as_millis() as u64,
            error_kind = *kind,
            error = %message,
            "Stage execution failed"
        ),
        None => tracing::info!(
            execution_id = %execution.id(),
            stage = %execution.stage(),
            state = %state,
            duration_ms = elapsed.as_millis() as u64,
            "Stage execution finished"
        ),
    }

    if let Err(e) = ctx.registry.release(execution) {
        tracing::error!(
            execution_id = %execution.id(),
            error = %e,
            "Failed to release execution from registry"
        );
    }
}
