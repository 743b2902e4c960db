//! Page segmentation into PAGE XML.

use super::{Invocation, StageTask, path_arg};
use crate::layout::{ImageType, ProjectLayout, extensions};
use crate::options::ToolSpec;
use crate::progress::ProgressSource;
use crate::stage::PipelineStage;
use async_trait::async_trait;
use pagerun_shared::errors::{PagerunError, PagerunResult};

const PROGRESS_CAP: u8 = 90;

/// Segments preprocessed images; writes `OCR/<page>.xml` per page.
///
/// After the tool finished, the segmented image is copied next to its XML
/// so later stages find both in `OCR/`.
#[derive(Debug, Clone, Default)]
pub struct SegmentationTask {
    /// Image flavour to segment; the project's own when `None`.
    pub image_type: Option<ImageType>,
    pub args: Vec<String>,
}

impl SegmentationTask {
    pub fn new(image_type: Option<ImageType>, args: Vec<String>) -> Self {
        Self { image_type, args }
    }

    fn image_type(&self, layout: &ProjectLayout) -> ImageType {
        self.image_type.unwrap_or(layout.image_type())
    }
}

#[async_trait]
impl StageTask for SegmentationTask {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Segmentation
    }

    fn invocations(
        &self,
        tool: &ToolSpec,
        layout: &ProjectLayout,
        pages: &[String],
    ) -> PagerunResult<Vec<Invocation>> {
        let image_type = self.image_type(layout);
        let mut args: Vec<String> = pages
            .iter()
            .map(|page| path_arg(&layout.image(image_type, page)))
            .collect();
        args.push("--output".to_string());
        args.push(path_arg(&layout.ocr_dir()));
        args.extend(self.args.iter().cloned());

        Ok(vec![Invocation::of(tool, args)])
    }

    fn progress_source(&self, layout: &ProjectLayout, _pages: &[String]) -> ProgressSource {
        ProgressSource::PageArtifacts {
            dir: layout.ocr_dir(),
            suffix: extensions::PAGE_XML.to_string(),
            cap: PROGRESS_CAP,
        }
    }

    async fn post_process(&self, layout: &ProjectLayout, pages: &[String]) -> PagerunResult<()> {
        let image_type = self.image_type(layout);
        for page in pages {
            let source = layout.image(image_type, page);
            let target = layout.segmentation_image(page);
            tokio::fs::copy(&source, &target).await.map_err(|e| {
                PagerunError::PostProcessing(format!(
                    "failed to copy {} to {}: {}",
                    source.display(),
                    target.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}
