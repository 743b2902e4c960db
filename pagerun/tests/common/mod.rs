//! Shared fixtures: a scratch project and `sh` scripts standing in for the
//! external tools.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pagerun::{
    EngineOptions, ExecutionState, ImageType, PipelineEngine, PipelineStage, ProjectLayout,
    StageExecution, ToolSpec,
};
use tempfile::TempDir;

/// Writes one `NNNN.bin.png`/`NNNN.nrm.png` pair per input image into the
/// directory following `-o`.
pub const PREPROCESS_OK: &str = r#"
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
i=0
for a in "$@"; do
  case "$a" in
    *.png)
      i=$((i+1))
      n=$(printf '%04d' "$i")
      echo "processing $a"
      echo "bin $a" > "$out/$n.bin.png"
      echo "nrm $a" > "$out/$n.nrm.png"
      ;;
  esac
done
"#;

/// Like [`PREPROCESS_OK`], pausing before each page.
pub const PREPROCESS_SLOW: &str = r#"
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
i=0
for a in "$@"; do
  case "$a" in
    *.png)
      sleep 0.15
      i=$((i+1))
      n=$(printf '%04d' "$i")
      echo "bin $a" > "$out/$n.bin.png"
      echo "nrm $a" > "$out/$n.nrm.png"
      ;;
  esac
done
"#;

/// Runs `sleep` as a child of the shell instead of replacing it.
pub const FORKED_HANG: &str = "sleep 20; true";

/// Produces the first page, then hangs until killed.
pub const PREPROCESS_HALF_THEN_HANG: &str = r#"
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
: > "$out/0001.bin.png"
exec sleep 30
"#;

/// Writes `<page>.xml` into the directory following `--output`.
pub const SEGMENT_OK: &str = r#"
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "--output" ]; then out="$a"; fi
  prev="$a"
done
for a in "$@"; do
  case "$a" in
    *.png) p=$(basename "$a" .png); echo "<PcGts/>" > "$out/$p.xml" ;;
  esac
done
"#;

/// Creates `<output>/<page>/region.png` for the page named by `--image`.
pub const EXTRACT_OK: &str = r#"
img=""; out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "--image" ]; then img="$a"; fi
  if [ "$prev" = "--output" ]; then out="$a"; fi
  prev="$a"
done
p=$(basename "$img" .png)
mkdir -p "$out/$p"
: > "$out/$p/region.png"
echo "extracted $p"
"#;

pub const HANG: &str = "exec sleep 30";

pub const SUCCEED: &str = "exit 0";

pub const FAIL: &str = "echo boom >&2; exit 3";

/// `sh -c <script>`; stage arguments arrive as `$1...`.
pub fn script_tool(script: &str) -> ToolSpec {
    ToolSpec::new("sh").with_args(["-c", script, "fake-tool"])
}

/// Options with fast polling, no retention and every tool succeeding.
pub fn options() -> EngineOptions {
    let mut options = EngineOptions::default();
    options.progress_poll_interval_ms = 20;
    options.stop_grace_period_ms = 500;
    options.retention_ms = 0;
    options.tools.preprocessing = script_tool(PREPROCESS_OK);
    options.tools.segmentation = script_tool(SEGMENT_OK);
    options.tools.region_extraction = script_tool(EXTRACT_OK);
    options.tools.ground_truth_search = script_tool(SUCCEED);
    options
}

pub fn engine_with(configure: impl FnOnce(&mut EngineOptions)) -> PipelineEngine {
    let mut options = options();
    configure(&mut options);
    PipelineEngine::new(options).unwrap()
}

pub fn set_tool(options: &mut EngineOptions, stage: PipelineStage, script: &str) {
    options.tools.set(stage, script_tool(script));
}

pub fn pages(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// Scratch project with `Original/<page>.png` for every page.
pub struct Project {
    pub dir: TempDir,
    pub layout: ProjectLayout,
}

impl Project {
    pub fn new(page_ids: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path(), ImageType::Binary);
        std::fs::create_dir_all(layout.original_dir()).unwrap();
        for page in page_ids {
            std::fs::write(layout.original_image(page), b"original").unwrap();
        }
        Self { dir, layout }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

pub async fn wait_terminal(execution: &Arc<StageExecution>) -> ExecutionState {
    tokio::time::timeout(Duration::from_secs(15), execution.wait())
        .await
        .expect("execution did not finish in time")
}

/// Poll until `check` holds or the timeout expires.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
