//! `gsm-node` – Global Segment Map node.
//!
//! Reads newline-delimited JSON observations from a file or stdin, runs the
//! segment map pipeline and mirrors every outbound event to stdout as JSON
//! lines.  Logs and the banner go to stderr.
//!
//! ```text
//! gsm-node [--config <path>] [--input <path>] [--init-config]
//! ```
//!
//! **Ctrl-C** requests a graceful shutdown: the final scene is published and
//! the mesh file, if configured, is written before exit.

mod config;

use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use gsm_kernel::MeshDirtyFlags;
use gsm_middleware::{JsonLinesSink, JsonLinesSource, MapBus, Topic};
use gsm_runtime::{
    ControllerConfig, NodeService, ShutdownReason, TelemetryConfig, VisualizationWorker,
    init_tracing,
};
use gsm_types::GsmError;

fn main() -> ExitCode {
    let args = Args::parse();

    let _telemetry = init_tracing(&TelemetryConfig::from_env("gsm-node"));
    print_banner();

    if args.init_config {
        let path = args.config.clone().unwrap_or_else(config::config_path);
        return match config::save_to(&config::Config::default(), &path) {
            Ok(()) => {
                eprintln!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Config error".red(), e);
                ExitCode::FAILURE
            }
        };
    }

    let cfg = match config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let controller_config = match cfg.to_controller_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Invalid config".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let input = args.input.or_else(|| cfg.input.clone());
    eprintln!(
        "  Mode {} · input {}\n",
        format!("{:?}", controller_config.variant).bold(),
        input
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdin".to_string())
            .dimmed()
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: cannot start runtime: {}", "error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run_node(controller_config, cfg.bus_capacity, input));
    // A stdin reader may still be parked on a blocking read.
    runtime.shutdown_timeout(Duration::from_millis(500));

    match result {
        Ok(reason) => {
            info!(%reason, "gsm-node stopped");
            eprintln!("  {} Stopped: {}", "✓".green().bold(), reason);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "gsm-node failed");
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run_node(
    config: ControllerConfig,
    bus_capacity: usize,
    input: Option<PathBuf>,
) -> Result<ShutdownReason, GsmError> {
    let bus = MapBus::new(bus_capacity);
    let sink = tokio::spawn(JsonLinesSink::new(bus.subscribe_all()).run(tokio::io::stdout()));
    let flags = Arc::new(MeshDirtyFlags::new());
    let visualization =
        VisualizationWorker::spawn(bus.subscribe_to(Topic::SceneMeshes), Arc::clone(&flags))?;

    // The service owns the last bus handle; the sink and the worker end once
    // it is dropped.
    let (service, handle, feed) = NodeService::new(config, bus, flags)?;

    let ctrlc_handle = handle.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – publishing final state …".yellow().bold());
        if !ctrlc_handle.try_shutdown() {
            eprintln!("{}", "  node is already stopping".dimmed());
        }
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let source = match input {
        Some(path) => JsonLinesSource::from_path(path),
        None => JsonLinesSource::stdin(),
    };
    let pump = tokio::spawn(async move { feed.pump(&source).await });

    let result = service.run().await;
    pump.abort();
    drop(handle);

    match sink.await {
        Ok(Ok(events)) => info!(events, "output closed"),
        Ok(Err(e)) => warn!(error = %e, "output sink failed"),
        Err(e) => warn!(error = %e, "output sink task failed"),
    }
    match tokio::task::spawn_blocking(move || visualization.join()).await {
        Ok(Ok(stats)) => info!(
            messages = stats.messages,
            blocks = stats.blocks,
            full_remesh_requests = stats.full_remesh_requests,
            "visualization stopped"
        ),
        Ok(Err(e)) => warn!(error = %e, "visualization worker failed"),
        Err(e) => warn!(error = %e, "visualization join failed"),
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "gsm-node", version)]
#[command(about = "Global Segment Map node: incremental object map from segment observations")]
struct Args {
    /// Config file (default ~/.gsm/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Observation file, one JSON object per line (default stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Write the default config and exit
    #[arg(long)]
    init_config: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    eprintln!();
    eprintln!("{}", r#"   ____  ____  __  __ "#.bold().cyan());
    eprintln!("{}", r#"  / ___|/ ___||  \/  |"#.bold().cyan());
    eprintln!("{}", r#" | |  _ \___ \| |\/| |"#.bold().cyan());
    eprintln!("{}", r#" | |_| | ___) | |  | |"#.bold().cyan());
    eprintln!("{}", r#"  \____||____/|_|  |_|"#.bold().cyan());
    eprintln!();
    eprintln!("  {} {}",
        "gsm-node".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    eprintln!("  Global Segment Map");
    eprintln!();
}
