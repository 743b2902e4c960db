//! pagerun CLI - run pipeline stages against a project directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use pagerun::tasks::{
    BoxedStageTask, GroundTruthSearchTask, PreprocessingTask, RegionExtractionTask,
    SegmentationTask,
};
use pagerun::{
    ConsoleStream, DependencyGraph, EngineOptions, ExecuteOutcome, ExecutionState, ImageType,
    PipelineEngine, PipelineStage, ProcessFlow, ProjectLayout, SessionId, StageExecution,
    StageRequest,
};

#[derive(Parser, Debug)]
#[command(
    name = "pagerun",
    version,
    about = "Run document digitization pipeline stages"
)]
struct Cli {
    /// Engine options file (JSON); defaults to the user config directory
    #[arg(long, global = true)]
    options: Option<PathBuf>,

    /// Also write logs to a daily file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one stage and wait for it
    Run(RunArgs),
    /// Run several stages in pipeline order
    Flow(FlowArgs),
    /// Report whether a stage already produced output for the pages
    Exists(ExistsArgs),
    /// Print the stage dependency graph
    Graph,
}

#[derive(Args, Debug, Clone)]
struct ProjectArgs {
    /// Project root directory
    #[arg(long)]
    project: PathBuf,

    /// Page identifier; repeat for several pages
    #[arg(long = "page", required = true)]
    pages: Vec<String>,

    #[arg(long, default_value_t = ImageType::Binary)]
    image_type: ImageType,
}

#[derive(Args, Debug, Clone)]
struct StageArgs {
    /// Extra tool argument; repeat for several
    #[arg(long = "arg", allow_hyphen_values = true)]
    tool_args: Vec<String>,

    /// Region padding in pixels
    #[arg(long, default_value_t = 10)]
    spacing: u32,

    /// Extract regions without padding
    #[arg(long, default_value_t = false)]
    no_spacing: bool,

    /// Fill masked areas with the average background colour
    #[arg(long, default_value_t = false)]
    average_background: bool,

    /// Print the console output of the tool when done
    #[arg(long, default_value_t = false)]
    show_console: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    stage: PipelineStage,

    #[command(flatten)]
    project: ProjectArgs,

    #[command(flatten)]
    stage_args: StageArgs,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Stages to run; all of them when omitted
    #[arg(long = "stage", value_delimiter = ',')]
    stages: Vec<PipelineStage>,

    #[command(flatten)]
    stage_args: StageArgs,
}

#[derive(Args, Debug)]
struct ExistsArgs {
    stage: PipelineStage,

    #[command(flatten)]
    project: ProjectArgs,
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = pagerun::init_logging(cli.log_dir.as_deref()) {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start runtime: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(cli)) {
        tracing::error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            tracing::error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Graph => {
            print_graph();
            Ok(())
        }
        Commands::Exists(args) => {
            let layout = layout_of(&args.project);
            let exists = layout.outputs_exist(args.stage, &args.project.pages);
            println!("{}", exists);
            Ok(())
        }
        Commands::Run(args) => {
            let engine = engine(cli.options)?;
            run_stage(&engine, args).await
        }
        Commands::Flow(args) => {
            let engine = engine(cli.options)?;
            run_flow(&engine, args).await
        }
    }
}

fn engine(options_path: Option<PathBuf>) -> Result<PipelineEngine> {
    let options = match options_path.or_else(EngineOptions::default_path) {
        Some(path) => EngineOptions::load(&path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => EngineOptions::default(),
    };
    PipelineEngine::new(options).context("invalid engine options")
}

fn layout_of(project: &ProjectArgs) -> ProjectLayout {
    ProjectLayout::new(&project.project, project.image_type)
}

fn session() -> SessionId {
    SessionId::new(format!("cli-{}", std::process::id()))
}

fn task_for(stage: PipelineStage, image_type: ImageType, args: &StageArgs) -> BoxedStageTask {
    match stage {
        PipelineStage::Preprocessing => Box::new(PreprocessingTask::new(args.tool_args.clone())),
        PipelineStage::Segmentation => Box::new(SegmentationTask::new(
            Some(image_type),
            args.tool_args.clone(),
        )),
        PipelineStage::RegionExtraction => Box::new(RegionExtractionTask {
            spacing: args.spacing,
            use_spacing: !args.no_spacing,
            use_average_background: args.average_background,
        }),
        PipelineStage::GroundTruthSearch => Box::new(GroundTruthSearchTask {
            image_type: Some(image_type),
        }),
    }
}

async fn run_stage(engine: &PipelineEngine, args: RunArgs) -> Result<()> {
    let session = session();
    let layout = layout_of(&args.project);
    let task = task_for(args.stage, args.project.image_type, &args.stage_args);
    let request = StageRequest::new(session, layout, args.project.pages.clone(), task);

    let execution = match engine.execute(request).await? {
        ExecuteOutcome::Accepted(execution) => execution,
        ExecuteOutcome::Rejected(kind) => bail!("{} rejected: {}", args.stage, kind),
    };

    let state = watch(engine, &execution).await;
    if args.stage_args.show_console {
        print_console(&execution);
    }

    match state {
        ExecutionState::Completed => Ok(()),
        ExecutionState::Cancelled => bail!("{} cancelled", args.stage),
        _ => bail!(
            "{} failed: {}",
            args.stage,
            execution.error().unwrap_or_else(|| "unknown error".into())
        ),
    }
}

async fn run_flow(engine: &PipelineEngine, args: FlowArgs) -> Result<()> {
    let stages = if args.stages.is_empty() {
        PipelineStage::ALL.to_vec()
    } else {
        args.stages.clone()
    };

    let flow = stages.iter().fold(ProcessFlow::new(), |flow, stage| {
        flow.then(task_for(*stage, args.project.image_type, &args.stage_args))
    });
    let planned = flow.len();
    let session = session();
    let layout = layout_of(&args.project);

    let reporter = spawn_flow_reporter(engine.clone(), session.clone(), stages);
    let report = flow
        .run(engine, &session, &layout, &args.project.pages)
        .await;
    reporter.abort();
    let report = report?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.succeeded(planned) {
        bail!("flow did not complete");
    }
    Ok(())
}

/// Print progress until the execution ends; Ctrl-C cancels it.
async fn watch(engine: &PipelineEngine, execution: &Arc<StageExecution>) -> ExecutionState {
    let interval = engine.options().progress_poll_interval();
    let mut last = None;
    let wait = execution.wait();
    tokio::pin!(wait);

    loop {
        tokio::select! {
            state = &mut wait => {
                println!("{}: {} ({}%)", execution.stage(), state, execution.progress());
                return state;
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling {}...", execution.stage());
                execution.cancel();
            }
            _ = tokio::time::sleep(interval) => {
                let progress = execution.progress();
                if last != Some(progress) {
                    println!("{}: {}%", execution.stage(), progress);
                    last = Some(progress);
                }
            }
        }
    }
}

fn spawn_flow_reporter(
    engine: PipelineEngine,
    session: SessionId,
    stages: Vec<PipelineStage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = engine.options().progress_poll_interval().max(Duration::from_millis(100));
        let mut last = None;
        loop {
            tokio::time::sleep(interval).await;
            let running = stages.iter().copied().find(|stage| {
                matches!(engine.state(&session, *stage), Ok(Some(ExecutionState::Running)))
            });
            let Some(stage) = running else { continue };
            let progress = engine.progress(&session, stage).unwrap_or(-1);
            if last != Some((stage, progress)) {
                println!("{}: {}%", stage, progress);
                last = Some((stage, progress));
            }
        }
    })
}

fn print_console(execution: &StageExecution) {
    let out = execution.console_output(ConsoleStream::Out);
    let err = execution.console_output(ConsoleStream::Err);
    if !out.is_empty() {
        println!("--- stdout ---\n{}", out.trim_end());
    }
    if !err.is_empty() {
        println!("--- stderr ---\n{}", err.trim_end());
    }
}

fn print_graph() {
    let graph = DependencyGraph::pipeline();
    for stage in PipelineStage::ALL {
        let upstream: Vec<&str> = graph.upstream_of(stage).iter().map(|s| s.as_str()).collect();
        let downstream: Vec<&str> = graph
            .downstream_of(stage)
            .iter()
            .map(|s| s.as_str())
            .collect();
        println!(
            "{}\n  upstream:   {}\n  downstream: {}",
            stage,
            if upstream.is_empty() { "-".to_string() } else { upstream.join(", ") },
            if downstream.is_empty() { "-".to_string() } else { downstream.join(", ") },
        );
    }
}
