//! Project directory layout and file naming conventions.
//!
//! ```text
//! <project>/
//! ├── Original/            source page images  (<page>.png)
//! ├── Preprocessing/       raw tool output     (NNNN.bin.png, NNNN.nrm.png)
//! │   ├── binary/          <page>.png
//! │   ├── gray/            <page>.png
//! │   └── despeckled/      <page>.png
//! ├── OCR/                 <page>.png, <page>.xml
//! │   └── Pages/           <page>/  extracted regions
//! └── Corpus/              ground truth corpus
//! ```

use crate::stage::PipelineStage;
use pagerun_shared::errors::{PagerunError, PagerunResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub mod extensions {
    /// Page image extension.
    pub const IMAGE: &str = ".png";
    /// Binarized image as written by the preprocessing tool.
    pub const RAW_BINARY: &str = ".bin.png";
    /// Normalized grayscale image as written by the preprocessing tool.
    pub const RAW_GRAY: &str = ".nrm.png";
    /// Page description document.
    pub const PAGE_XML: &str = ".xml";
}

mod dir_names {
    pub const ORIGINAL: &str = "Original";
    pub const PREPROCESSING: &str = "Preprocessing";
    pub const BINARY: &str = "binary";
    pub const GRAY: &str = "gray";
    pub const DESPECKLED: &str = "despeckled";
    pub const OCR: &str = "OCR";
    pub const PAGES: &str = "Pages";
    pub const CORPUS: &str = "Corpus";
}

/// Image flavour a project (or a stage run) works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    #[default]
    Binary,
    Gray,
    Despeckled,
}

impl ImageType {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageType::Binary => "binary",
            ImageType::Gray => "gray",
            ImageType::Despeckled => "despeckled",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = PagerunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(ImageType::Binary),
            "gray" => Ok(ImageType::Gray),
            "despeckled" => Ok(ImageType::Despeckled),
            other => Err(PagerunError::InvalidArgument(format!(
                "unknown image type: {}",
                other
            ))),
        }
    }
}

/// Paths of one project. Cheap to clone, never touches the filesystem
/// except in [`ProjectLayout::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
    image_type: ImageType,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>, image_type: ImageType) -> Self {
        Self {
            root: root.into(),
            image_type,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn original_dir(&self) -> PathBuf {
        self.root.join(dir_names::ORIGINAL)
    }

    pub fn preprocessing_dir(&self) -> PathBuf {
        self.root.join(dir_names::PREPROCESSING)
    }

    pub fn image_dir(&self, image_type: ImageType) -> PathBuf {
        let sub = match image_type {
            ImageType::Binary => dir_names::BINARY,
            ImageType::Gray => dir_names::GRAY,
            ImageType::Despeckled => dir_names::DESPECKLED,
        };
        self.preprocessing_dir().join(sub)
    }

    pub fn ocr_dir(&self) -> PathBuf {
        self.root.join(dir_names::OCR)
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.ocr_dir().join(dir_names::PAGES)
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.root.join(dir_names::CORPUS)
    }

    pub fn original_image(&self, page: &str) -> PathBuf {
        self.original_dir()
            .join(format!("{}{}", page, extensions::IMAGE))
    }

    pub fn image(&self, image_type: ImageType, page: &str) -> PathBuf {
        self.image_dir(image_type)
            .join(format!("{}{}", page, extensions::IMAGE))
    }

    pub fn segmentation_xml(&self, page: &str) -> PathBuf {
        self.ocr_dir()
            .join(format!("{}{}", page, extensions::PAGE_XML))
    }

    pub fn segmentation_image(&self, page: &str) -> PathBuf {
        self.ocr_dir().join(format!("{}{}", page, extensions::IMAGE))
    }

    pub fn region_dir(&self, page: &str) -> PathBuf {
        self.pages_dir().join(page)
    }

    /// Artifacts a stage produces for one page; removed before a re-run.
    pub fn stage_outputs(&self, stage: PipelineStage, page: &str) -> Vec<PathBuf> {
        match stage {
            PipelineStage::Preprocessing => vec![
                self.image(ImageType::Binary, page),
                self.image(ImageType::Gray, page),
            ],
            PipelineStage::Segmentation => {
                vec![self.segmentation_xml(page), self.segmentation_image(page)]
            }
            PipelineStage::RegionExtraction => vec![self.region_dir(page)],
            PipelineStage::GroundTruthSearch => Vec::new(),
        }
    }

    /// Whether any output of `stage` already exists for one of `pages`.
    pub fn outputs_exist(&self, stage: PipelineStage, pages: &[String]) -> bool {
        pages.iter().any(|page| {
            let marker = match stage {
                PipelineStage::Preprocessing => self.stage_outputs(stage, page),
                PipelineStage::Segmentation => vec![self.segmentation_xml(page)],
                PipelineStage::RegionExtraction => vec![self.region_dir(page)],
                PipelineStage::GroundTruthSearch => Vec::new(),
            };
            marker.iter().any(|path| path.exists())
        })
    }

    /// Create the directories a stage writes into.
    pub fn prepare(&self, stage: PipelineStage) -> PagerunResult<()> {
        let dirs = match stage {
            PipelineStage::Preprocessing => vec![
                self.preprocessing_dir(),
                self.image_dir(ImageType::Binary),
                self.image_dir(ImageType::Gray),
            ],
            PipelineStage::Segmentation => vec![self.ocr_dir()],
            PipelineStage::RegionExtraction => vec![self.ocr_dir(), self.pages_dir()],
            PipelineStage::GroundTruthSearch => vec![self.corpus_dir()],
        };

        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| {
                PagerunError::Storage(format!(
                    "failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}
