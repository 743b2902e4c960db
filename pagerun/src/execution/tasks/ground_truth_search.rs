//! Search of the project corpus for ground-truth candidates.

use super::{Invocation, StageTask, path_arg};
use crate::layout::{ImageType, ProjectLayout};
use crate::options::ToolSpec;
use crate::progress::ProgressSource;
use crate::stage::PipelineStage;
use async_trait::async_trait;
use pagerun_shared::errors::PagerunResult;

/// Runs the search tool over `Corpus/`. Writes nothing this crate tracks,
/// so there is no intermediate progress and nothing to clean up.
#[derive(Debug, Clone, Default)]
pub struct GroundTruthSearchTask {
    /// Image flavour to search; the project's own when `None`.
    pub image_type: Option<ImageType>,
}

#[async_trait]
impl StageTask for GroundTruthSearchTask {
    fn stage(&self) -> PipelineStage {
        PipelineStage::GroundTruthSearch
    }

    fn invocations(
        &self,
        tool: &ToolSpec,
        layout: &ProjectLayout,
        _pages: &[String],
    ) -> PagerunResult<Vec<Invocation>> {
        let image_type = self.image_type.unwrap_or(layout.image_type());
        let args = vec![
            "--image-type".to_string(),
            image_type.as_str().to_string(),
            path_arg(&layout.corpus_dir()),
        ];
        Ok(vec![Invocation::of(tool, args)])
    }

    fn progress_source(&self, _layout: &ProjectLayout, _pages: &[String]) -> ProgressSource {
        ProgressSource::Unobservable
    }
}
