//! Sequential multi-stage runs.
//!
//! A [`ProcessFlow`] runs several stages over the same pages, one after the
//! other. Each request is marked `in_pipeline_flow`.

use std::time::Instant;

use pagerun_shared::errors::{PagerunError, PagerunResult};
use serde::Serialize;

use crate::conflict::ConflictKind;
use crate::engine::{ExecuteOutcome, PipelineEngine, StageRequest};
use crate::execution::ExecutionState;
use crate::execution::tasks::BoxedStageTask;
use crate::layout::ProjectLayout;
use crate::registry::SessionId;
use crate::stage::PipelineStage;

/// How one stage of a flow ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlowStageOutcome {
    Completed,
    Cancelled,
    Failed { error: Option<String> },
    Rejected { conflict: ConflictKind },
}

impl FlowStageOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, FlowStageOutcome::Completed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowStageReport {
    pub stage: PipelineStage,
    #[serde(flatten)]
    pub outcome: FlowStageOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub total_duration_ms: u64,
    pub stages: Vec<FlowStageReport>,
}

impl FlowReport {
    /// Whether every stage of the flow completed.
    pub fn succeeded(&self, planned: usize) -> bool {
        self.stages.len() == planned && self.stages.iter().all(|s| s.outcome.is_completed())
    }

    pub fn stage_duration_ms(&self, stage: PipelineStage) -> Option<u64> {
        self.stages
            .iter()
            .find(|report| report.stage == stage)
            .map(|report| report.duration_ms)
    }
}

/// Ordered list of stage tasks.
#[derive(Default)]
pub struct ProcessFlow {
    steps: Vec<BoxedStageTask>,
}

impl ProcessFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, task: BoxedStageTask) -> Self {
        self.steps.push(task);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn stages(&self) -> Vec<PipelineStage> {
        self.steps.iter().map(|task| task.stage()).collect()
    }

    /// Run every step in order, stopping at the first one that does not
    /// complete.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a step is listed after one of its downstream
    /// stages, or if the engine rejects the page list.
    pub async fn run(
        self,
        engine: &PipelineEngine,
        session: &SessionId,
        layout: &ProjectLayout,
        pages: &[String],
    ) -> PagerunResult<FlowReport> {
        self.validate_order(engine)?;

        let total_start = Instant::now();
        let mut stages = Vec::with_capacity(self.steps.len());

        for task in self.steps {
            let stage = task.stage();
            let stage_start = Instant::now();

            let request = StageRequest::new(session.clone(), layout.clone(), pages.to_vec(), task)
                .in_pipeline_flow(true);

            let outcome = match engine.execute(request).await? {
                ExecuteOutcome::Rejected(conflict) => FlowStageOutcome::Rejected { conflict },
                ExecuteOutcome::Accepted(execution) => match execution.wait().await {
                    ExecutionState::Completed => FlowStageOutcome::Completed,
                    ExecutionState::Cancelled => FlowStageOutcome::Cancelled,
                    _ => FlowStageOutcome::Failed {
                        error: execution.error(),
                    },
                },
            };

            let duration_ms = stage_start.elapsed().as_millis() as u64;
            tracing::info!(
                session = %session,
                stage = %stage,
                outcome = ?outcome,
                duration_ms = duration_ms,
                "Flow stage finished"
            );

            let done = outcome.is_completed();
            stages.push(FlowStageReport {
                stage,
                outcome,
                duration_ms,
            });
            if !done {
                break;
            }
        }

        Ok(FlowReport {
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            stages,
        })
    }

    fn validate_order(&self, engine: &PipelineEngine) -> PagerunResult<()> {
        let graph = engine.policy().graph();
        for (i, earlier) in self.steps.iter().enumerate() {
            for later in &self.steps[i + 1..] {
                if graph.is_ancestor(later.stage(), earlier.stage()) {
                    return Err(PagerunError::InvalidArgument(format!(
                        "{} must run before {}",
                        later.stage(),
                        earlier.stage()
                    )));
                }
            }
        }
        Ok(())
    }
}
