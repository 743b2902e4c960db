//! Dependency-aware conflict detection.
//!
//! The pipeline's stage dependencies are declared once as an edge table and
//! closed transitively at first use. Every stage shares the same rules:
//!
//! ```text
//! Preprocessing ──→ Segmentation ──→ RegionExtraction ──→ GroundTruthSearch
//! ```
//!
//! An edge `A → B` means B consumes A's output.

use crate::stage::PipelineStage;
use pagerun_shared::errors::{PagerunError, PagerunResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

const STAGE_COUNT: usize = PipelineStage::ALL.len();

/// Producer → consumer edges of the digitization pipeline.
const PIPELINE_EDGES: &[(PipelineStage, PipelineStage)] = &[
    (PipelineStage::Preprocessing, PipelineStage::Segmentation),
    (PipelineStage::Segmentation, PipelineStage::RegionExtraction),
    (PipelineStage::RegionExtraction, PipelineStage::GroundTruthSearch),
];

static PIPELINE_GRAPH: OnceLock<DependencyGraph> = OnceLock::new();

/// Reason a requested execution must be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    None,
    /// The same stage is already running for this session.
    SelfConflict,
    /// A stage producing this stage's input is still running.
    UpstreamRunning,
    /// A stage consuming this stage's output is still running.
    DownstreamRunning,
}

impl ConflictKind {
    pub fn is_conflict(self) -> bool {
        self != ConflictKind::None
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConflictKind::None => "none",
            ConflictKind::SelfConflict => "stage already running",
            ConflictKind::UpstreamRunning => "upstream stage still running",
            ConflictKind::DownstreamRunning => "downstream stage still running",
        };
        f.write_str(text)
    }
}

/// Transitively closed stage dependency graph.
///
/// `ancestors[b][a]` is true when `a` is (directly or indirectly) upstream of `b`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ancestors: [[bool; STAGE_COUNT]; STAGE_COUNT],
}

impl DependencyGraph {
    /// Build a graph from producer → consumer edges.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the edges contain a cycle.
    pub fn from_edges(edges: &[(PipelineStage, PipelineStage)]) -> PagerunResult<Self> {
        let mut ancestors = [[false; STAGE_COUNT]; STAGE_COUNT];
        for (producer, consumer) in edges {
            ancestors[consumer.index()][producer.index()] = true;
        }

        // Floyd–Warshall style closure, the graph is tiny
        for via in 0..STAGE_COUNT {
            for to in 0..STAGE_COUNT {
                if !ancestors[to][via] {
                    continue;
                }
                for from in 0..STAGE_COUNT {
                    if ancestors[via][from] {
                        ancestors[to][from] = true;
                    }
                }
            }
        }

        if let Some(stage) = PipelineStage::ALL
            .into_iter()
            .find(|stage| ancestors[stage.index()][stage.index()])
        {
            return Err(PagerunError::Config(format!(
                "stage dependency cycle through {}",
                stage
            )));
        }

        Ok(Self { ancestors })
    }

    /// The graph of the digitization pipeline.
    pub fn pipeline() -> &'static DependencyGraph {
        PIPELINE_GRAPH.get_or_init(|| {
            // The edge table is a constant chain; closure cannot fail.
            match DependencyGraph::from_edges(PIPELINE_EDGES) {
                Ok(graph) => graph,
                Err(e) => unreachable!("pipeline edge table is acyclic: {}", e),
            }
        })
    }

    /// Whether `candidate` is upstream of `stage`.
    pub fn is_ancestor(&self, candidate: PipelineStage, stage: PipelineStage) -> bool {
        self.ancestors[stage.index()][candidate.index()]
    }

    /// Whether `candidate` is downstream of `stage`.
    pub fn is_descendant(&self, candidate: PipelineStage, stage: PipelineStage) -> bool {
        self.is_ancestor(stage, candidate)
    }

    pub fn upstream_of(&self, stage: PipelineStage) -> Vec<PipelineStage> {
        PipelineStage::ALL
            .into_iter()
            .filter(|candidate| self.is_ancestor(*candidate, stage))
            .collect()
    }

    pub fn downstream_of(&self, stage: PipelineStage) -> Vec<PipelineStage> {
        PipelineStage::ALL
            .into_iter()
            .filter(|candidate| self.is_descendant(*candidate, stage))
            .collect()
    }
}

/// Decides whether a stage may start given the stages already active.
#[derive(Debug, Clone, Copy)]
pub struct ConflictPolicy {
    graph: &'static DependencyGraph,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::new(DependencyGraph::pipeline())
    }
}

impl ConflictPolicy {
    pub fn new(graph: &'static DependencyGraph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &'static DependencyGraph {
        self.graph
    }

    /// Classify a request against the active stage set.
    ///
    /// `in_pipeline_flow` suppresses only the upstream check; self and
    /// downstream conflicts are always reported.
    pub fn classify(
        &self,
        requested: PipelineStage,
        active: &HashSet<PipelineStage>,
        in_pipeline_flow: bool,
    ) -> ConflictKind {
        if active.contains(&requested) {
            return ConflictKind::SelfConflict;
        }

        if !in_pipeline_flow
            && active
                .iter()
                .any(|running| self.graph.is_ancestor(*running, requested))
        {
            return ConflictKind::UpstreamRunning;
        }

        if active
            .iter()
            .any(|running| self.graph.is_descendant(*running, requested))
        {
            return ConflictKind::DownstreamRunning;
        }

        ConflictKind::None
    }
}
