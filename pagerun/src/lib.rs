//! pagerun - stage execution engine for document digitization pipelines.
//!
//! Runs the external tools behind each pipeline stage (preprocessing,
//! segmentation, region extraction, ground-truth search) over a set of
//! pages, reports progress from the files they produce, and refuses
//! requests that would race with a dependent stage.
//!
//! ```no_run
//! use pagerun::{EngineOptions, ImageType, PipelineEngine, ProjectLayout, SessionId, StageRequest};
//! use pagerun::tasks::PreprocessingTask;
//!
//! # async fn demo() -> pagerun::PagerunResult<()> {
//! let engine = PipelineEngine::new(EngineOptions::default())?;
//! let request = StageRequest::new(
//!     SessionId::new("session-1"),
//!     ProjectLayout::new("/data/project", ImageType::Binary),
//!     vec!["0001".into(), "0002".into()],
//!     Box::new(PreprocessingTask::default()),
//! );
//! if let Some(execution) = engine.execute(request).await?.execution() {
//!     execution.wait().await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod conflict;
pub mod engine;
pub mod execution;
pub mod flow;
pub mod layout;
mod logging;
pub mod metrics;
pub mod options;
pub mod process;
pub mod progress;
pub mod registry;
pub mod stage;

pub use conflict::{ConflictKind, ConflictPolicy, DependencyGraph};
pub use engine::{ExecuteOutcome, PipelineEngine, StageRequest};
pub use execution::tasks;
pub use execution::{ExecutionId, ExecutionInfo, ExecutionState, StageExecution};
pub use flow::{FlowReport, FlowStageOutcome, FlowStageReport, ProcessFlow};
pub use layout::{ImageType, ProjectLayout};
pub use logging::init_logging;
pub use metrics::EngineMetrics;
pub use options::{ConflictScope, EngineOptions, ToolPaths, ToolSpec};
pub use process::{Console, ConsoleStream, ProcessExit, ProcessHandle};
pub use progress::{PROGRESS_COMPLETE, PROGRESS_SENTINEL};
pub use registry::{ExecutionRegistry, SessionId};
pub use stage::PipelineStage;

pub use pagerun_shared::errors::{PagerunError, PagerunResult};
