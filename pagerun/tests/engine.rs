//! End-to-end engine behavior with scripted tools.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use pagerun::tasks::{PreprocessingTask, RegionExtractionTask, SegmentationTask};
use pagerun::{
    ConflictKind, ConflictScope, ConsoleStream, ExecuteOutcome, ExecutionState, ImageType,
    PROGRESS_SENTINEL, PagerunError, PipelineEngine, PipelineStage, SessionId, StageExecution,
    StageRequest,
};

fn preprocessing(session: &SessionId, project: &Project, ids: &[&str]) -> StageRequest {
    StageRequest::new(
        session.clone(),
        project.layout.clone(),
        pages(ids),
        Box::new(PreprocessingTask::default()),
    )
}

async fn accept(engine: &PipelineEngine, request: StageRequest) -> Arc<StageExecution> {
    match engine.execute(request).await.unwrap() {
        ExecuteOutcome::Accepted(execution) => execution,
        ExecuteOutcome::Rejected(kind) => panic!("unexpected rejection: {}", kind),
    }
}

#[tokio::test]
async fn test_preprocessing_completes_and_moves_outputs() {
    let engine = engine_with(|_| {});
    let project = Project::new(&["a", "b"]);
    let session = SessionId::new("s1");

    let execution = accept(&engine, preprocessing(&session, &project, &["a", "b"])).await;
    assert_eq!(wait_terminal(&execution).await, ExecutionState::Completed);

    assert_eq!(execution.progress(), 100);
    let layout = &project.layout;
    let binary_b = std::fs::read_to_string(layout.image(ImageType::Binary, "b")).unwrap();
    assert!(binary_b.contains("Original/b.png"));
    assert!(layout.image(ImageType::Gray, "a").exists());
    assert!(!layout.preprocessing_dir().join("0001.bin.png").exists());

    let out = execution.console_output(ConsoleStream::Out);
    let first = out.find("Original/a.png").unwrap();
    let second = out.find("Original/b.png").unwrap();
    assert!(first < second);

    // Zero retention: the entry is gone once terminal
    assert!(
        eventually(|| engine.registry().is_empty().unwrap()).await,
        "registry entry not removed"
    );
    assert!(engine.files_exist(PipelineStage::Preprocessing, layout, &pages(&["a"])));

    let metrics = engine.metrics();
    assert_eq!(metrics.executions_started, 1);
    assert_eq!(metrics.executions_completed, 1);
}

#[tokio::test]
async fn test_upstream_running_rejects_without_side_effects() {
    let engine = engine_with(|o| set_tool(o, PipelineStage::Preprocessing, HANG));
    let project = Project::new(&["a"]);
    let session = SessionId::new("s1");

    let running = accept(&engine, preprocessing(&session, &project, &["a"])).await;

    let segmentation = StageRequest::new(
        session.clone(),
        project.layout.clone(),
        pages(&["a"]),
        Box::new(SegmentationTask::default()),
    );
    let outcome = engine.execute(segmentation).await.unwrap();
    assert_eq!(outcome.conflict(), ConflictKind::UpstreamRunning);
    assert_eq!(engine.registry().len().unwrap(), 1);
    assert_eq!(
        engine.state(&session, PipelineStage::Segmentation).unwrap(),
        None
    );
    assert_eq!(engine.metrics().conflicts_rejected, 1);

    assert!(engine.cancel(&session, PipelineStage::Preprocessing).unwrap());
    assert_eq!(wait_terminal(&running).await, ExecutionState::Cancelled);
}

#[tokio::test]
async fn test_same_stage_twice_is_self_conflict() {
    let engine = engine_with(|o| set_tool(o, PipelineStage::Preprocessing, HANG));
    let project = Project::new(&["a"]);
    let session = SessionId::new("s1");

    let running = accept(&engine, preprocessing(&session, &project, &["a"])).await;
    let outcome = engine
        .execute(preprocessing(&session, &project, &["a"]))
        .await
        .unwrap();
    assert_eq!(outcome.conflict(), ConflictKind::SelfConflict);

    // Another session is independent under session scope
    let other = accept(&engine, preprocessing(&SessionId::new("s2"), &project, &["a"])).await;

    running.cancel();
    other.cancel();
    assert_eq!(wait_terminal(&running).await, ExecutionState::Cancelled);
    assert_eq!(wait_terminal(&other).await, ExecutionState::Cancelled);
}

#[tokio::test]
async fn test_downstream_running_rejects_upstream_request() {
    let engine = engine_with(|o| set_tool(o, PipelineStage::RegionExtraction, HANG));
    let project = Project::new(&["a"]);
    let session = SessionId::new("s1");

    let extraction = accept(
        &engine,
        StageRequest::new(
            session.clone(),
            project.layout.clone(),
            pages(&["a"]),
            Box::new(RegionExtractionTask::default()),
        ),
    )
    .await;

    let outcome = engine
        .execute(preprocessing(&session, &project, &["a"]).in_pipeline_flow(true))
        .await
        .unwrap();
    assert_eq!(outcome.conflict(), ConflictKind::DownstreamRunning);

    extraction.cancel();
    assert_eq!(wait_terminal(&extraction).await, ExecutionState::Cancelled);
}

#[tokio::test]
async fn test_in_pipeline_flow_skips_upstream_check() {
    let engine = engine_with(|o| set_tool(o, PipelineStage::Preprocessing, HANG));
    let project = Project::new(&["a", "z"]);
    let session = SessionId::new("s1");

    std::fs::create_dir_all(project.layout.image_dir(ImageType::Binary)).unwrap();
    std::fs::write(project.layout.image(ImageType::Binary, "a"), b"img").unwrap();

    // Different page, so its stale-output cleanup leaves "a" alone
    let upstream = accept(&engine, preprocessing(&session, &project, &["z"])).await;
    let segmentation = accept(
        &engine,
        StageRequest::new(
            session.clone(),
            project.layout.clone(),
            pages(&["a"]),
            Box::new(SegmentationTask::default()),
        )
        .in_pipeline_flow(true),
    )
    .await;

    assert_eq!(wait_terminal(&segmentation).await, ExecutionState::Completed);
    assert!(project.layout.segmentation_xml("a").exists());
    assert!(project.layout.segmentation_image("a").exists());

    upstream.cancel();
    assert_eq!(wait_terminal(&upstream).await, ExecutionState::Cancelled);
}

#[tokio::test]
async fn test_cancel_mid_run_resets_progress() {
    let engine = engine_with(|o| set_tool(o, PipelineStage::Preprocessing, PREPROCESS_HALF_THEN_HANG));
    let project = Project::new(&["a", "b"]);
    let session = SessionId::new("s1");

    let execution = accept(&engine, preprocessing(&session, &project, &["a", "b"])).await;

    // One of two raw outputs: half of the pages
    assert!(
        eventually(|| execution.progress() == 50).await,
        "progress never reached 50, got {}",
        execution.progress()
    );
    assert_eq!(
        engine.progress(&session, PipelineStage::Preprocessing).unwrap(),
        50
    );

    assert!(engine.cancel(&session, PipelineStage::Preprocessing).unwrap());
    assert_eq!(wait_terminal(&execution).await, ExecutionState::Cancelled);
    assert_eq!(execution.progress(), PROGRESS_SENTINEL);
    assert!(execution.exit().is_some_and(|exit| !exit.success()));
    assert!(eventually(|| engine.registry().is_empty().unwrap()).await);
    assert_eq!(engine.metrics().executions_cancelled, 1);
}

#[tokio::test]
async fn test_cancel_escalates_when_tool_ignores_sigterm() {
    let engine = engine_with(|o| {
        o.stop_grace_period_ms = 200;
        set_tool(
            o,
            PipelineStage::Preprocessing,
            "trap '' TERM; while true; do sleep 0.05; done",
        );
    });
    let project = Project::new(&["a"]);
    let session = SessionId::new("s1");

    let execution = accept(&engine, preprocessing(&session, &project, &["a"])).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    execution.cancel();
    assert_eq!(wait_terminal(&execution).await, ExecutionState::Cancelled);
    assert_eq!(
        execution.exit().and_then(|exit| exit.signal),
        Some(libc::SIGKILL)
    );
}

#[tokio::test]
async fn test_cancel_stops_processes_started_by_the_tool() {
    let engine = engine_with(|o| set_tool(o, PipelineStage::Preprocessing, FORKED_HANG));
    let project = Project::new(&["a"]);
    let session = SessionId::new("s1");

    let execution = accept(&engine, preprocessing(&session, &project, &["a"])).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let cancelled_at = Instant::now();
    assert!(execution.cancel());
    let state = tokio::time::timeout(Duration::from_secs(5), execution.wait())
        .await
        .expect("cancelled execution still running");

    assert_eq!(state, ExecutionState::Cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));
    assert_eq!(execution.progress(), PROGRESS_SENTINEL);
    assert!(eventually(|| engine.registry().is_empty().unwrap()).await);
}

#[tokio::test]
async fn test_progress_never_decreases_during_successful_run() {
    let engine = engine_with(|o| set_tool(o, PipelineStage::Preprocessing, PREPROCESS_SLOW));
    let ids = ["a", "b", "c", "d"];
    let project = Project::new(&ids);
    let session = SessionId::new("s1");

    let execution = accept(&engine, preprocessing(&session, &project, &ids)).await;

    let mut samples = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(15);
    while !execution.state().is_terminal() && Instant::now() < deadline {
        samples.push(execution.progress());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(execution.state(), ExecutionState::Completed);
    samples.push(execution.progress());

    assert!(
        samples.windows(2).all(|pair| pair[0] <= pair[1]),
        "progress went backwards: {:?}",
        samples
    );
    // Estimates stay under the cap; only completion reports 100
    assert!(samples.iter().all(|p| (0..=90).contains(p) || *p == 100));
    assert!(samples.iter().any(|p| (1..90).contains(p)), "no intermediate progress: {:?}", samples);
    assert_eq!(samples.last(), Some(&100));
}

#[tokio::test]
async fn test_cancel_without_running_execution_is_noop() {
    let engine = engine_with(|_| {});
    let project = Project::new(&["a"]);
    let session = SessionId::new("s1");

    assert!(!engine.cancel(&session, PipelineStage::Preprocessing).unwrap());

    let execution = accept(&engine, preprocessing(&session, &project, &["a"])).await;
    assert_eq!(wait_terminal(&execution).await, ExecutionState::Completed);

    assert!(!execution.cancel());
    assert!(!engine.cancel(&session, PipelineStage::Preprocessing).unwrap());
    assert_eq!(execution.state(), ExecutionState::Completed);
    assert_eq!(execution.progress(), 100);
}

#[tokio::test]
async fn test_failing_tool_fails_and_keeps_console() {
    let engine = engine_with(|o| {
        o.retention_ms = 60_000;
        set_tool(o, PipelineStage::Preprocessing, FAIL);
    });
    let project = Project::new(&["a"]);
    let session = SessionId::new("s1");

    // Stale output of an earlier run
    let stale = project.layout.image(ImageType::Binary, "a");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, b"stale").unwrap();
    assert!(engine.files_exist(PipelineStage::Preprocessing, &project.layout, &pages(&["a"])));

    let execution = accept(&engine, preprocessing(&session, &project, &["a"])).await;
    assert_eq!(wait_terminal(&execution).await, ExecutionState::Failed);

    assert_eq!(execution.progress(), PROGRESS_SENTINEL);
    assert!(!stale.exists(), "stale output survived the re-run");
    assert_eq!(execution.exit().and_then(|exit| exit.code), Some(3));

    // Retained for observers, but no longer blocking the stage
    let console = engine
        .console(&session, PipelineStage::Preprocessing, ConsoleStream::Err)
        .unwrap();
    assert!(console.contains("boom"));
    assert!(
        engine
            .registry()
            .active_stages_for(&session)
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        engine.state(&session, PipelineStage::Preprocessing).unwrap(),
        Some(ExecutionState::Failed)
    );
    assert!(eventually(|| engine.metrics().executions_failed == 1).await);

    engine
        .reset_progress(&session, PipelineStage::Preprocessing)
        .unwrap();
    assert_eq!(execution.progress(), PROGRESS_SENTINEL);
}

#[tokio::test]
async fn test_missing_binary_fails_execution() {
    let engine = engine_with(|o| {
        o.tools.preprocessing = pagerun::ToolSpec::new("/nonexistent/pagerun-tool");
    });
    let project = Project::new(&["a"]);
    let session = SessionId::new("s1");

    let execution = accept(&engine, preprocessing(&session, &project, &["a"])).await;
    assert_eq!(wait_terminal(&execution).await, ExecutionState::Failed);
    assert_eq!(execution.progress(), PROGRESS_SENTINEL);
    assert!(execution.error().unwrap().contains("launch"));
    assert!(
        execution
            .console_output(ConsoleStream::Err)
            .contains("/nonexistent/pagerun-tool")
    );
}

#[tokio::test]
async fn test_missing_original_dir_fails_before_spawn() {
    let engine = engine_with(|_| {});
    let dir = tempfile::tempdir().unwrap();
    let layout = pagerun::ProjectLayout::new(dir.path(), ImageType::Binary);
    let session = SessionId::new("s1");

    let execution = accept(
        &engine,
        StageRequest::new(
            session,
            layout,
            pages(&["a"]),
            Box::new(PreprocessingTask::default()),
        ),
    )
    .await;
    assert_eq!(wait_terminal(&execution).await, ExecutionState::Failed);
    assert!(execution.exit().is_none());
}

#[tokio::test]
async fn test_invalid_pages_rejected_before_side_effects() {
    let engine = engine_with(|_| {});
    let project = Project::new(&["a"]);
    let session = SessionId::new("s1");

    let err = engine
        .execute(preprocessing(&session, &project, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, PagerunError::InvalidArgument(_)));

    let err = engine
        .execute(preprocessing(&session, &project, &["a", "a"]))
        .await
        .unwrap_err();
    assert!(matches!(err, PagerunError::InvalidArgument(_)));

    assert!(engine.registry().is_empty().unwrap());
    assert!(!project.layout.preprocessing_dir().exists());
    assert_eq!(engine.metrics().executions_started, 0);
}

#[tokio::test]
async fn test_region_extraction_runs_per_page() {
    let engine = engine_with(|_| {});
    let project = Project::new(&["a", "b", "c"]);
    let session = SessionId::new("s1");

    let execution = accept(
        &engine,
        StageRequest::new(
            session,
            project.layout.clone(),
            pages(&["a", "b", "c"]),
            Box::new(RegionExtractionTask::default()),
        ),
    )
    .await;
    assert_eq!(wait_terminal(&execution).await, ExecutionState::Completed);

    for page in ["a", "b", "c"] {
        assert!(project.layout.region_dir(page).join("region.png").exists());
    }
    let out = execution.console_output(ConsoleStream::Out);
    assert_eq!(out.lines().collect::<Vec<_>>(), vec!["extracted a", "extracted b", "extracted c"]);
}

#[tokio::test]
async fn test_project_scope_spans_sessions() {
    let engine = engine_with(|o| {
        o.conflict_scope = ConflictScope::Project;
        set_tool(o, PipelineStage::Preprocessing, HANG);
    });
    let shared = Project::new(&["a"]);
    let other = Project::new(&["a"]);

    let running = accept(&engine, preprocessing(&SessionId::new("s1"), &shared, &["a"])).await;

    let same_project = StageRequest::new(
        SessionId::new("s2"),
        shared.layout.clone(),
        pages(&["a"]),
        Box::new(SegmentationTask::default()),
    );
    assert_eq!(
        engine.execute(same_project).await.unwrap().conflict(),
        ConflictKind::UpstreamRunning
    );

    let other_project = accept(&engine, preprocessing(&SessionId::new("s2"), &other, &["a"])).await;

    running.cancel();
    other_project.cancel();
    wait_terminal(&running).await;
    wait_terminal(&other_project).await;
    assert!(shared.root() != other.root());
}

#[tokio::test]
async fn test_project_scope_rejects_second_run_of_stage_in_session() {
    let engine = engine_with(|o| {
        o.conflict_scope = ConflictScope::Project;
        set_tool(o, PipelineStage::Preprocessing, HANG);
    });
    let first = Project::new(&["a"]);
    let second = Project::new(&["a"]);
    let session = SessionId::new("s1");

    let running = accept(&engine, preprocessing(&session, &first, &["a"])).await;

    let outcome = engine
        .execute(preprocessing(&session, &second, &["a"]))
        .await
        .unwrap();
    assert_eq!(outcome.conflict(), ConflictKind::SelfConflict);
    assert!(!second.layout.image_dir(ImageType::Binary).exists());
    assert_eq!(engine.metrics().conflicts_rejected, 1);

    running.cancel();
    assert_eq!(wait_terminal(&running).await, ExecutionState::Cancelled);
}
