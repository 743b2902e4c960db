//! Public entry point: accepts stage requests, enforces conflicts and
//! answers queries about running and recently finished executions.

use std::collections::HashSet;
use std::sync::Arc;

use pagerun_shared::errors::{PagerunError, PagerunResult};

use crate::conflict::{ConflictKind, ConflictPolicy};
use crate::execution::lifecycle::{self, RunContext};
use crate::execution::tasks::BoxedStageTask;
use crate::execution::{ExecutionInfo, ExecutionState, StageExecution};
use crate::layout::ProjectLayout;
use crate::metrics::{EngineMetrics, EngineMetricsStorage};
use crate::options::{ConflictScope, EngineOptions};
use crate::process::ConsoleStream;
use crate::progress::PROGRESS_SENTINEL;
use crate::registry::{ActiveScope, ExecutionRegistry, SessionId};
use crate::stage::PipelineStage;

/// A request to run one stage over a set of pages.
pub struct StageRequest {
    pub session: SessionId,
    pub layout: ProjectLayout,
    pub pages: Vec<String>,
    pub task: BoxedStageTask,
    /// Set by a caller that runs stages strictly in sequence; skips the
    /// upstream-running check.
    pub in_pipeline_flow: bool,
}

impl StageRequest {
    pub fn new(
        session: SessionId,
        layout: ProjectLayout,
        pages: Vec<String>,
        task: BoxedStageTask,
    ) -> Self {
        Self {
            session,
            layout,
            pages,
            task,
            in_pipeline_flow: false,
        }
    }

    pub fn in_pipeline_flow(mut self, in_pipeline_flow: bool) -> Self {
        self.in_pipeline_flow = in_pipeline_flow;
        self
    }

    pub fn stage(&self) -> PipelineStage {
        self.task.stage()
    }
}

impl std::fmt::Debug for StageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRequest")
            .field("session", &self.session)
            .field("stage", &self.stage())
            .field("project", &self.layout.root())
            .field("pages", &self.pages)
            .field("in_pipeline_flow", &self.in_pipeline_flow)
            .finish()
    }
}

/// Result of [`PipelineEngine::execute`].
#[derive(Debug, Clone)]
pub enum ExecuteOutcome {
    /// Registered and started; runs in the background.
    Accepted(Arc<StageExecution>),
    /// Refused without side effects.
    Rejected(ConflictKind),
}

impl ExecuteOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ExecuteOutcome::Accepted(_))
    }

    pub fn execution(&self) -> Option<&Arc<StageExecution>> {
        match self {
            ExecuteOutcome::Accepted(execution) => Some(execution),
            ExecuteOutcome::Rejected(_) => None,
        }
    }

    /// Conflict that caused a rejection; `ConflictKind::None` if accepted.
    pub fn conflict(&self) -> ConflictKind {
        match self {
            ExecuteOutcome::Accepted(_) => ConflictKind::None,
            ExecuteOutcome::Rejected(kind) => *kind,
        }
    }
}

/// Stage execution engine.
///
/// Cloneable; clones share the registry, metrics and options.
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    options: Arc<EngineOptions>,
    policy: ConflictPolicy,
    registry: ExecutionRegistry,
    metrics: Arc<EngineMetricsStorage>,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("conflict_scope", &self.inner.options.conflict_scope)
            .finish()
    }
}

impl PipelineEngine {
    /// # Errors
    ///
    /// Returns `Config` if `options` fail validation.
    pub fn new(options: EngineOptions) -> PagerunResult<Self> {
        options.validate()?;
        let registry = ExecutionRegistry::new(options.retention());
        Ok(Self {
            inner: Arc::new(EngineInner {
                options: Arc::new(options),
                policy: ConflictPolicy::default(),
                registry,
                metrics: Arc::new(EngineMetricsStorage::new()),
            }),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.inner.policy
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.inner.registry
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics::from_storage(&self.inner.metrics)
    }

    /// Check conflicts, register and start the requested stage.
    ///
    /// Returns immediately after the execution was started; use
    /// [`StageExecution::wait`] to await its end. Must be called within a
    /// Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty or duplicated page list, before any
    ///   side effect
    /// - `Internal` if the registry is unusable
    pub async fn execute(&self, request: StageRequest) -> PagerunResult<ExecuteOutcome> {
        validate_pages(&request.pages)?;

        let StageRequest {
            session,
            layout,
            pages,
            task,
            in_pipeline_flow,
        } = request;
        let stage = task.stage();

        let execution = Arc::new(StageExecution::new(
            session,
            stage,
            pages,
            layout,
            in_pipeline_flow,
        ));

        let scope = match self.inner.options.conflict_scope {
            ConflictScope::Session => ActiveScope::Session,
            ConflictScope::Project => ActiveScope::Project(execution.layout().root()),
        };
        let policy = self.inner.policy;
        let kind = self
            .inner
            .registry
            .register_if(Arc::clone(&execution), scope, |active| {
                policy.classify(stage, active, in_pipeline_flow)
            })?;

        if kind.is_conflict() {
            self.inner.metrics.record_rejected();
            tracing::info!(
                session = %execution.session(),
                stage = %stage,
                conflict = %kind,
                "Stage request rejected"
            );
            return Ok(ExecuteOutcome::Rejected(kind));
        }

        execution.begin();
        self.inner.metrics.record_started();

        let ctx = RunContext {
            registry: self.inner.registry.clone(),
            metrics: Arc::clone(&self.inner.metrics),
            options: Arc::clone(&self.inner.options),
        };
        tokio::spawn(lifecycle::run(Arc::clone(&execution), task, ctx));

        Ok(ExecuteOutcome::Accepted(execution))
    }

    /// Classify a hypothetical request without registering anything.
    pub fn check_conflict(
        &self,
        session: &SessionId,
        layout: &ProjectLayout,
        stage: PipelineStage,
        in_pipeline_flow: bool,
    ) -> PagerunResult<ConflictKind> {
        let active = self.active_stages(session, layout)?;
        Ok(self.inner.policy.classify(stage, &active, in_pipeline_flow))
    }

    /// Stages counted against requests from `session` on `layout`.
    pub fn active_stages(
        &self,
        session: &SessionId,
        layout: &ProjectLayout,
    ) -> PagerunResult<HashSet<PipelineStage>> {
        match self.inner.options.conflict_scope {
            ConflictScope::Session => self.inner.registry.active_stages_for(session),
            ConflictScope::Project => self.inner.registry.active_stages_for_project(layout.root()),
        }
    }

    pub fn execution(
        &self,
        session: &SessionId,
        stage: PipelineStage,
    ) -> PagerunResult<Option<Arc<StageExecution>>> {
        self.inner.registry.get(session, stage)
    }

    /// Progress of the registered execution, `-1` when there is none.
    pub fn progress(&self, session: &SessionId, stage: PipelineStage) -> PagerunResult<i32> {
        Ok(self
            .execution(session, stage)?
            .map_or(PROGRESS_SENTINEL, |execution| execution.progress()))
    }

    /// Captured output so far; empty when there is no execution.
    pub fn console(
        &self,
        session: &SessionId,
        stage: PipelineStage,
        stream: ConsoleStream,
    ) -> PagerunResult<String> {
        Ok(self
            .execution(session, stage)?
            .map(|execution| execution.console_output(stream))
            .unwrap_or_default())
    }

    pub fn state(
        &self,
        session: &SessionId,
        stage: PipelineStage,
    ) -> PagerunResult<Option<ExecutionState>> {
        Ok(self
            .execution(session, stage)?
            .map(|execution| execution.state()))
    }

    pub fn info(
        &self,
        session: &SessionId,
        stage: PipelineStage,
    ) -> PagerunResult<Option<ExecutionInfo>> {
        Ok(self
            .execution(session, stage)?
            .map(|execution| execution.info()))
    }

    /// Cancel the execution of `stage` in `session`.
    ///
    /// Returns whether a running execution received the request. A missing
    /// or finished execution is not an error.
    pub fn cancel(&self, session: &SessionId, stage: PipelineStage) -> PagerunResult<bool> {
        Ok(self
            .execution(session, stage)?
            .is_some_and(|execution| execution.cancel()))
    }

    pub fn reset_progress(&self, session: &SessionId, stage: PipelineStage) -> PagerunResult<()> {
        if let Some(execution) = self.execution(session, stage)? {
            execution.reset_progress();
        }
        Ok(())
    }

    /// Whether outputs of `stage` already exist for any of `pages`.
    pub fn files_exist(&self, stage: PipelineStage, layout: &ProjectLayout, pages: &[String]) -> bool {
        layout.outputs_exist(stage, pages)
    }

    /// Snapshots of all registered executions, newest first.
    pub fn list(&self) -> PagerunResult<Vec<ExecutionInfo>> {
        self.inner.registry.list()
    }
}

fn validate_pages(pages: &[String]) -> PagerunResult<()> {
    if pages.is_empty() {
        return Err(PagerunError::InvalidArgument(
            "page list must not be empty".into(),
        ));
    }

    let mut seen = HashSet::with_capacity(pages.len());
    for page in pages {
        if page.is_empty() || page.contains(['/', '\\']) || page == "." || page == ".." {
            return Err(PagerunError::InvalidArgument(format!(
                "invalid page identifier {:?}",
                page
            )));
        }
        if !seen.insert(page.as_str()) {
            return Err(PagerunError::InvalidArgument(format!(
                "duplicate page identifier {:?}",
                page
            )));
        }
    }
    Ok(())
}
