//! Pipeline stage identifiers.

use pagerun_shared::errors::PagerunError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of the digitization pipeline.
///
/// The set is closed. Ordering of the variants follows the order in which
/// the stages consume each other's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Preprocessing,
    Segmentation,
    RegionExtraction,
    GroundTruthSearch,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Preprocessing,
        PipelineStage::Segmentation,
        PipelineStage::RegionExtraction,
        PipelineStage::GroundTruthSearch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Preprocessing => "preprocessing",
            PipelineStage::Segmentation => "segmentation",
            PipelineStage::RegionExtraction => "region_extraction",
            PipelineStage::GroundTruthSearch => "ground_truth_search",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            PipelineStage::Preprocessing => 0,
            PipelineStage::Segmentation => 1,
            PipelineStage::RegionExtraction => 2,
            PipelineStage::GroundTruthSearch => 3,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = PagerunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        PipelineStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| PagerunError::InvalidArgument(format!("unknown stage: {}", s)))
    }
}
