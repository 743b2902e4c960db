//! Engine configuration.

use crate::stage::PipelineStage;
use pagerun_shared::errors::{PagerunError, PagerunResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// External program plus the fixed arguments placed before stage arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// External tool for every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub preprocessing: ToolSpec,
    pub segmentation: ToolSpec,
    pub region_extraction: ToolSpec,
    pub ground_truth_search: ToolSpec,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            preprocessing: ToolSpec::new("ocropus-nlbin"),
            segmentation: ToolSpec::new("ocr4all-helper-scripts").with_args(["segment"]),
            region_extraction: ToolSpec::new("ocr4all-helper-scripts").with_args(["pagelineseg"]),
            ground_truth_search: ToolSpec::new("ocr4all-helper-scripts").with_args(["gtsearch"]),
        }
    }
}

impl ToolPaths {
    pub fn for_stage(&self, stage: PipelineStage) -> &ToolSpec {
        match stage {
            PipelineStage::Preprocessing => &self.preprocessing,
            PipelineStage::Segmentation => &self.segmentation,
            PipelineStage::RegionExtraction => &self.region_extraction,
            PipelineStage::GroundTruthSearch => &self.ground_truth_search,
        }
    }

    pub fn set(&mut self, stage: PipelineStage, tool: ToolSpec) {
        match stage {
            PipelineStage::Preprocessing => self.preprocessing = tool,
            PipelineStage::Segmentation => self.segmentation = tool,
            PipelineStage::RegionExtraction => self.region_extraction = tool,
            PipelineStage::GroundTruthSearch => self.ground_truth_search = tool,
        }
    }
}

/// Which executions count as "active" when classifying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictScope {
    /// Only executions of the requesting session.
    #[default]
    Session,
    /// Executions of every session working on the same project root.
    Project,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub tools: ToolPaths,
    pub stop_grace_period_ms: u64,
    pub progress_poll_interval_ms: u64,
    /// Time a terminal execution stays readable in the registry.
    pub retention_ms: u64,
    pub capture_console: bool,
    pub conflict_scope: ConflictScope,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            stop_grace_period_ms: 5_000,
            progress_poll_interval_ms: 500,
            retention_ms: 30_000,
            capture_console: true,
            conflict_scope: ConflictScope::Session,
        }
    }
}

impl EngineOptions {
    /// `<config_dir>/pagerun/options.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pagerun").join("options.json"))
    }

    /// Load options from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> PagerunResult<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No options file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(PagerunError::Config(format!(
                    "failed to read options {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let options: Self = serde_json::from_str(&data).map_err(|e| {
            PagerunError::Config(format!("invalid options {}: {}", path.display(), e))
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> PagerunResult<()> {
        if self.progress_poll_interval_ms == 0 {
            return Err(PagerunError::Config(
                "progress_poll_interval_ms must be positive".into(),
            ));
        }
        for stage in PipelineStage::ALL {
            if self.tools.for_stage(stage).program.trim().is_empty() {
                return Err(PagerunError::Config(format!(
                    "no program configured for {}",
                    stage
                )));
            }
        }
        Ok(())
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.progress_poll_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}
