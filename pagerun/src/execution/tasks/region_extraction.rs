//! Cutting segmented regions out of page images.

use super::{Invocation, StageTask, path_arg};
use crate::layout::ProjectLayout;
use crate::options::ToolSpec;
use crate::progress::ProgressSource;
use crate::stage::PipelineStage;
use async_trait::async_trait;
use pagerun_shared::errors::PagerunResult;

const PROGRESS_CAP: u8 = 95;

/// One tool run per page; cancellation takes effect between pages.
#[derive(Debug, Clone)]
pub struct RegionExtractionTask {
    /// Pixels of padding around each region, when `use_spacing` is set.
    pub spacing: u32,
    pub use_spacing: bool,
    /// Fill masked-out areas with the average background colour.
    pub use_average_background: bool,
}

impl Default for RegionExtractionTask {
    fn default() -> Self {
        Self {
            spacing: 10,
            use_spacing: true,
            use_average_background: false,
        }
    }
}

#[async_trait]
impl StageTask for RegionExtractionTask {
    fn stage(&self) -> PipelineStage {
        PipelineStage::RegionExtraction
    }

    fn invocations(
        &self,
        tool: &ToolSpec,
        layout: &ProjectLayout,
        pages: &[String],
    ) -> PagerunResult<Vec<Invocation>> {
        let output = path_arg(&layout.pages_dir());
        let invocations = pages
            .iter()
            .map(|page| {
                let mut args = vec![
                    "--image".to_string(),
                    path_arg(&layout.segmentation_image(page)),
                    "--xml".to_string(),
                    path_arg(&layout.segmentation_xml(page)),
                    "--output".to_string(),
                    output.clone(),
                ];
                if self.use_spacing {
                    args.push("--spacing".to_string());
                    args.push(self.spacing.to_string());
                }
                if self.use_average_background {
                    args.push("--average-background".to_string());
                }
                Invocation::of(tool, args).for_page(page.as_str())
            })
            .collect();
        Ok(invocations)
    }

    fn progress_source(&self, _layout: &ProjectLayout, _pages: &[String]) -> ProgressSource {
        ProgressSource::PerInvocation { cap: PROGRESS_CAP }
    }
}
