use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reel_core::bookend::BookendPhase;
use reel_core::preflight::PreflightOptions;
use reel_core::scheduling::TaskPriority;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reel_worker::admission::AdmissionController;
use reel_worker::backend::{ComfyUIBackend, GenerationBackend};
use reel_worker::bookend::{BookendRequest, BookendRunner, Keyframe};
use reel_worker::config::WorkerConfig;
use reel_worker::engine::ExecutionEngine;
use reel_worker::events::{EventSink, GenerationEvent, DEFAULT_EVENT_BUFFER};
use reel_worker::queue::TaskQueue;
use reel_worker::splice::FfmpegSplicer;

/// How often queue and server health are logged.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "reel-worker", about = "Generation orchestration worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the task queue until interrupted (the default).
    Serve,
    /// Render a start and an end segment, splice them, then exit.
    Bookend(BookendArgs),
}

#[derive(Args, Debug, Clone)]
struct BookendArgs {
    #[arg(long)]
    scene: String,

    /// Image-to-video workflow in API format.
    #[arg(long)]
    workflow: PathBuf,

    #[arg(long)]
    start: PathBuf,

    #[arg(long)]
    end: PathBuf,

    /// `LoadImage` node to inject keyframes into; defaults to the first one.
    #[arg(long)]
    image_node: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reel_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid worker configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(
        comfyui_url = %config.comfyui_url,
        profile = %config.workflow_profile,
        preset = %config.preset,
        "Loaded worker configuration",
    );

    // --- Backend and engine ---
    let backend = Arc::new(ComfyUIBackend::new(
        config.comfyui_url.clone(),
        config.comfyui_ws_url.clone(),
    ));
    let engine = ExecutionEngine::new(config.breaker.clone(), config.retry.clone());

    // --- Startup preflight ---
    let admission = AdmissionController::new(Arc::clone(&backend), engine.clone());
    let mut options = PreflightOptions::new(config.preset);
    options.allow_downgrade = config.allow_downgrade;
    let preflight = admission
        .run_resource_preflight(&config.workflow_profile, options)
        .await;
    for message in &preflight.messages {
        tracing::info!(code = message.code, level = ?message.level, "{}", message.message);
    }
    if !preflight.can_proceed() {
        tracing::warn!("Preflight blocked; jobs will fail until the server recovers");
    }

    // --- Events ---
    let (events, mut event_rx) = EventSink::channel(DEFAULT_EVENT_BUFFER);
    let event_logger = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match &event {
                GenerationEvent::TaskProgress { .. } => tracing::debug!(?event, "Generation event"),
                _ => tracing::info!(?event, "Generation event"),
            }
        }
    });

    // --- Queue ---
    let queue = TaskQueue::start(engine, events.clone());
    tracing::info!("Task queue started");

    let exit_code = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            drop(events);
            serve(queue.clone(), Arc::clone(&backend)).await;
            0
        }
        Command::Bookend(args) => {
            match run_bookend(&config, backend, queue.clone(), events, args).await {
                Ok(path) => {
                    tracing::info!(%path, "Bookend video written");
                    0
                }
                Err(e) => {
                    tracing::error!(error = %e, "Bookend job failed");
                    1
                }
            }
        }
    };

    // --- Shutdown ---
    queue.shutdown().await;
    tracing::info!("Task queue stopped");

    drop(queue);
    let _ = tokio::time::timeout(Duration::from_secs(5), event_logger).await;
    tracing::info!("Graceful shutdown complete");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

/// Log health until SIGINT/SIGTERM.
async fn serve(queue: TaskQueue, backend: Arc<ComfyUIBackend>) {
    let health_cancel = CancellationToken::new();
    let health_handle = tokio::spawn(log_health(queue, backend, health_cancel.clone()));
    shutdown_signal().await;
    health_cancel.cancel();
    let _ = health_handle.await;
}

/// Run one bookend job to a terminal phase. A signal cancels it.
async fn run_bookend(
    config: &WorkerConfig,
    backend: Arc<ComfyUIBackend>,
    queue: TaskQueue,
    events: EventSink,
    args: BookendArgs,
) -> Result<String, String> {
    let output_dir = config
        .output_dir
        .clone()
        .ok_or("COMFYUI_OUTPUT_DIR must be set to splice bookend videos")?;
    let request = load_request(args).await?;

    let splicer = Arc::new(FfmpegSplicer::new(output_dir));
    let runner = BookendRunner::new(backend, splicer, queue, config.poll, events)
        .map_err(|e| e.to_string())?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let signal = tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    let job = runner.run(request, &cancel).await;
    signal.abort();

    match (job.phase(), job.final_artifact_path()) {
        (BookendPhase::Complete, Some(path)) => Ok(path.to_string()),
        _ => Err(job.failure_reason().unwrap_or("Bookend job failed").to_string()),
    }
}

async fn load_request(args: BookendArgs) -> Result<BookendRequest, String> {
    let raw = tokio::fs::read(&args.workflow)
        .await
        .map_err(|e| format!("{}: {e}", args.workflow.display()))?;
    let workflow = serde_json::from_slice(&raw)
        .map_err(|e| format!("{}: {e}", args.workflow.display()))?;
    Ok(BookendRequest {
        scene_id: args.scene,
        workflow,
        start_keyframe: load_keyframe(&args.start).await?,
        end_keyframe: load_keyframe(&args.end).await?,
        image_node: args.image_node,
        priority: TaskPriority::default(),
    })
}

async fn load_keyframe(path: &Path) -> Result<Keyframe, String> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("{}: not a file", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("{}: {e}", path.display()))?;
    Ok(Keyframe { filename, bytes })
}

async fn log_health(queue: TaskQueue, backend: Arc<ComfyUIBackend>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let health = queue.health();
        let server = match backend.queue().await {
            Ok(snapshot) => format!(
                "{} running, {} pending",
                snapshot.running.len(),
                snapshot.pending.len()
            ),
            Err(e) => format!("unavailable ({e})"),
        };
        if health.service.is_healthy() {
            tracing::info!(
                state = ?health.state,
                depth = health.depth,
                breaker = ?health.circuit_breaker.state,
                %server,
                "Queue health",
            );
        } else {
            tracing::warn!(
                state = ?health.state,
                depth = health.depth,
                service = ?health.service,
                %server,
                "Service degraded, pausing new jobs",
            );
        }
    }
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_serves() {
        let cli = Cli::try_parse_from(["reel-worker"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn bookend_requires_both_keyframes() {
        let err = Cli::try_parse_from([
            "reel-worker",
            "bookend",
            "--scene",
            "scene-7",
            "--workflow",
            "i2v.json",
            "--start",
            "start.png",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn bookend_args_parse() {
        let cli = Cli::try_parse_from([
            "reel-worker",
            "bookend",
            "--scene",
            "scene-7",
            "--workflow",
            "i2v.json",
            "--start",
            "frames/start.png",
            "--end",
            "frames/end.png",
            "--image-node",
            "2",
        ])
        .unwrap();
        let Some(Command::Bookend(args)) = cli.command else {
            panic!("expected bookend command");
        };
        assert_eq!(args.scene, "scene-7");
        assert_eq!(args.end, PathBuf::from("frames/end.png"));
        assert_eq!(args.image_node.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn keyframe_takes_file_name_and_bytes() {
        let dir = std::env::temp_dir().join(format!("reel-worker-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("scene-7_start.png");
        tokio::fs::write(&path, b"PNG").await.unwrap();

        let keyframe = load_keyframe(&path).await.unwrap();
        assert_eq!(keyframe.filename, "scene-7_start.png");
        assert_eq!(keyframe.bytes, b"PNG");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn bookend_without_output_dir_is_refused() {
        let config = WorkerConfig::from_lookup(|_| None).unwrap();
        assert!(config.output_dir.is_none());
        let engine = ExecutionEngine::new(config.breaker.clone(), config.retry.clone());
        let queue = TaskQueue::start(engine, EventSink::disabled());
        let backend = Arc::new(ComfyUIBackend::new("http://127.0.0.1:9", "ws://127.0.0.1:9"));
        let args = BookendArgs {
            scene: "scene-7".into(),
            workflow: "missing.json".into(),
            start: "start.png".into(),
            end: "end.png".into(),
            image_node: None,
        };

        let err = run_bookend(&config, backend, queue.clone(), EventSink::disabled(), args)
            .await
            .unwrap_err();
        assert!(err.contains("COMFYUI_OUTPUT_DIR"));
        queue.shutdown().await;
    }
}
