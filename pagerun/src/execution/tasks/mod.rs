//! Stage-specific behavior plugged into the generic execution lifecycle.
//!
//! A [`StageTask`] describes what to run for one stage: the tool
//! invocations, where progress can be observed and what to do with the
//! tool's output afterwards. The lifecycle handles everything else.

mod ground_truth_search;
mod preprocessing;
mod region_extraction;
mod segmentation;

pub use ground_truth_search::GroundTruthSearchTask;
pub use preprocessing::PreprocessingTask;
pub use region_extraction::RegionExtractionTask;
pub use segmentation::SegmentationTask;

use crate::layout::ProjectLayout;
use crate::options::ToolSpec;
use crate::progress::ProgressSource;
use crate::stage::PipelineStage;
use async_trait::async_trait;
use pagerun_shared::errors::{PagerunError, PagerunResult};
use std::io::ErrorKind;
use std::path::Path;

/// One external program run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Page this invocation covers, for per-page stages.
    pub page: Option<String>,
}

impl Invocation {
    /// Invocation of `tool` with its fixed arguments followed by `args`.
    pub fn of(tool: &ToolSpec, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: tool.program.clone(),
            args: tool.args.iter().cloned().chain(args).collect(),
            page: None,
        }
    }

    pub fn for_page(mut self, page: impl Into<String>) -> Self {
        self.page = Some(page.into());
        self
    }
}

/// Stage-specific part of an execution.
#[async_trait]
pub trait StageTask: Send + Sync {
    fn stage(&self) -> PipelineStage;

    /// Fail early if required inputs are missing. Runs before anything on
    /// disk is touched.
    fn check_inputs(&self, _layout: &ProjectLayout, _pages: &[String]) -> PagerunResult<()> {
        Ok(())
    }

    /// Extra preparation after stale outputs were removed.
    async fn prepare(&self, _layout: &ProjectLayout, _pages: &[String]) -> PagerunResult<()> {
        Ok(())
    }

    /// Processes to run, in order. The lifecycle checks for cancellation
    /// between them.
    fn invocations(
        &self,
        tool: &ToolSpec,
        layout: &ProjectLayout,
        pages: &[String],
    ) -> PagerunResult<Vec<Invocation>>;

    fn progress_source(&self, layout: &ProjectLayout, pages: &[String]) -> ProgressSource;

    /// Turn raw tool output into final artifacts. Runs only after every
    /// invocation exited successfully.
    async fn post_process(&self, _layout: &ProjectLayout, _pages: &[String]) -> PagerunResult<()> {
        Ok(())
    }
}

pub type BoxedStageTask = Box<dyn StageTask>;

/// Default task for `stage`, with default parameters.
pub fn default_task(stage: PipelineStage) -> BoxedStageTask {
    match stage {
        PipelineStage::Preprocessing => Box::new(PreprocessingTask::default()),
        PipelineStage::Segmentation => Box::new(SegmentationTask::default()),
        PipelineStage::RegionExtraction => Box::new(RegionExtractionTask::default()),
        PipelineStage::GroundTruthSearch => Box::new(GroundTruthSearchTask::default()),
    }
}

/// Delete `stage` outputs of `pages` left over from an earlier run.
pub(crate) async fn remove_stale_outputs(
    layout: &ProjectLayout,
    stage: PipelineStage,
    pages: &[String],
) -> PagerunResult<()> {
    for page in pages {
        for path in layout.stage_outputs(stage, page) {
            remove_path(&path).await?;
        }
    }
    Ok(())
}

/// Remove a file or directory tree; absent paths are fine.
pub(crate) async fn remove_path(path: &Path) -> PagerunResult<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(storage_error("inspect", path, e)),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => {
            tracing::trace!(path = %path.display(), "Removed stale output");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(storage_error("remove", path, e)),
    }
}

pub(crate) fn storage_error(action: &str, path: &Path, e: std::io::Error) -> PagerunError {
    PagerunError::Storage(format!("failed to {} {}: {}", action, path.display(), e))
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
