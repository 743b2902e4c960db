//! Binarization and normalization of original page images.

use super::{Invocation, StageTask, path_arg, remove_path, storage_error};
use crate::layout::{ImageType, ProjectLayout, extensions};
use crate::options::ToolSpec;
use crate::progress::ProgressSource;
use crate::stage::PipelineStage;
use async_trait::async_trait;
use pagerun_shared::errors::{PagerunError, PagerunResult};
use std::path::{Path, PathBuf};

/// Progress stops here until the raw outputs were moved into place.
const PROGRESS_CAP: u8 = 90;

/// Runs the binarization tool once over all pages.
///
/// The tool numbers its outputs by position in the input list
/// (`0001.bin.png`, `0001.nrm.png`, ...); post-processing renames them to
/// `binary/<page>.png` and `gray/<page>.png`.
#[derive(Debug, Clone, Default)]
pub struct PreprocessingTask {
    /// Extra tool arguments, appended after the output directory.
    pub args: Vec<String>,
}

impl PreprocessingTask {
    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }
}

#[async_trait]
impl StageTask for PreprocessingTask {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Preprocessing
    }

    fn check_inputs(&self, layout: &ProjectLayout, _pages: &[String]) -> PagerunResult<()> {
        let original = layout.original_dir();
        if !original.is_dir() {
            return Err(PagerunError::Storage(format!(
                "original image directory {} does not exist",
                original.display()
            )));
        }
        Ok(())
    }

    async fn prepare(&self, layout: &ProjectLayout, _pages: &[String]) -> PagerunResult<()> {
        // Raw files of an interrupted run would be counted and moved again
        for suffix in [extensions::RAW_BINARY, extensions::RAW_GRAY] {
            for path in raw_outputs(&layout.preprocessing_dir(), suffix).await? {
                remove_path(&path).await?;
            }
        }
        Ok(())
    }

    fn invocations(
        &self,
        tool: &ToolSpec,
        layout: &ProjectLayout,
        pages: &[String],
    ) -> PagerunResult<Vec<Invocation>> {
        let mut args: Vec<String> = pages
            .iter()
            .map(|page| path_arg(&layout.original_image(page)))
            .collect();
        args.push("-o".to_string());
        args.push(path_arg(&layout.preprocessing_dir()));
        args.extend(self.args.iter().cloned());

        Ok(vec![Invocation::of(tool, args)])
    }

    fn progress_source(&self, layout: &ProjectLayout, _pages: &[String]) -> ProgressSource {
        ProgressSource::Directory {
            dir: layout.preprocessing_dir(),
            suffix: extensions::RAW_BINARY.to_string(),
            cap: PROGRESS_CAP,
        }
    }

    async fn post_process(&self, layout: &ProjectLayout, pages: &[String]) -> PagerunResult<()> {
        move_raw_outputs(layout, pages, extensions::RAW_BINARY, ImageType::Binary).await?;
        move_raw_outputs(layout, pages, extensions::RAW_GRAY, ImageType::Gray).await
    }
}

/// Files in `dir` ending with `suffix`, sorted by name.
async fn raw_outputs(dir: &Path, suffix: &str) -> PagerunResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(storage_error("read", dir, e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| storage_error("read", dir, e))?
    {
        let is_match = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(suffix));
        if is_match {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Page a raw output belongs to, from its 1-based sequence number.
fn page_for<'a>(file_name: &str, suffix: &str, pages: &'a [String]) -> PagerunResult<&'a str> {
    let number = file_name
        .strip_suffix(suffix)
        .and_then(|stem| stem.parse::<usize>().ok())
        .ok_or_else(|| {
            PagerunError::PostProcessing(format!("unexpected tool output name {}", file_name))
        })?;

    number
        .checked_sub(1)
        .and_then(|index| pages.get(index))
        .map(String::as_str)
        .ok_or_else(|| {
            PagerunError::PostProcessing(format!(
                "tool output {} does not match any of {} pages",
                file_name,
                pages.len()
            ))
        })
}

async fn move_raw_outputs(
    layout: &ProjectLayout,
    pages: &[String],
    suffix: &str,
    image_type: ImageType,
) -> PagerunResult<()> {
    let files = raw_outputs(&layout.preprocessing_dir(), suffix)
        .await
        .map_err(|e| PagerunError::PostProcessing(e.to_string()))?;

    if files.len() < pages.len() {
        tracing::warn!(
            expected = pages.len(),
            found = files.len(),
            suffix = suffix,
            "Preprocessing produced fewer images than pages"
        );
    }

    for file in files {
        let file_name = file
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let page = page_for(&file_name, suffix, pages)?;
        let target = layout.image(image_type, page);

        tokio::fs::rename(&file, &target).await.map_err(|e| {
            PagerunError::PostProcessing(format!(
                "failed to move {} to {}: {}",
                file.display(),
                target.display(),
                e
            ))
        })?;
        tracing::trace!(page = page, target = %target.display(), "Moved preprocessed image");
    }
    Ok(())
}
