//! RouteKit manager daemon.
//!
//! Loads the schema tree, reads the boot configuration, commits it against
//! the module daemons, then supervises until shutdown.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use rtkit::commit::CommitEngine;
use rtkit::config::ConfigTree;
use rtkit::supervisor::ProcessSupervisor;
use rtkit::task::TaskManager;
use rtkit::template::TemplateTree;
use rtkit_bus::{CallBus, SignatureDb, UnconnectedBus};

use settings::Settings;

/// RouteKit manager - control plane of the RouteKit routing suite
#[derive(Parser)]
#[command(name = "routekit-manager")]
#[command(about = "RouteKit manager - control plane of the RouteKit routing suite")]
#[command(version)]
struct Cli {
    /// Path to the manager's configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Template directory override
    #[arg(short, long)]
    templates: Option<PathBuf>,

    /// Boot configuration override
    #[arg(short, long)]
    boot: Option<PathBuf>,

    /// Verify only; never start processes or issue remote calls
    #[arg(long)]
    no_execute: bool,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the manager
    Run,
    /// Validate templates and boot configuration, then exit
    Check,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(ref path) = cli.config {
        if !path.is_file() {
            anyhow::bail!("config file does not exist: {}", path.display());
        }
    }

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(templates) = cli.templates {
        settings.templates_dir = templates;
    }
    if let Some(boot) = cli.boot {
        settings.boot_config = boot;
    }
    if cli.no_execute {
        settings.execute = false;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(settings).await,
        Commands::Check => check(&settings).await,
    }
}

fn load_signatures(settings: &Settings) -> Result<SignatureDb> {
    match &settings.signatures_dir {
        Some(dir) => SignatureDb::load_dir(dir)
            .with_context(|| format!("loading signatures from {}", dir.display())),
        None => {
            tracing::warn!("no signature directory configured; signature checks skipped");
            Ok(SignatureDb::permissive())
        }
    }
}

fn load_trees(settings: &Settings) -> Result<(Arc<TemplateTree>, ConfigTree)> {
    let sigdb = load_signatures(settings)?;
    let template = Arc::new(
        TemplateTree::load(&settings.templates_dir, &sigdb).with_context(|| {
            format!("loading templates from {}", settings.templates_dir.display())
        })?,
    );
    tracing::info!(
        templates = %settings.templates_dir.display(),
        modules = template.modules().count(),
        "schema tree loaded"
    );

    let mut tree = ConfigTree::new(Arc::clone(&template));
    let text = std::fs::read_to_string(&settings.boot_config).with_context(|| {
        format!("reading boot configuration {}", settings.boot_config.display())
    })?;
    tree.parse(&text, &settings.boot_config.display().to_string(), 0)?;
    tree.add_default_children();
    Ok((template, tree))
}

async fn check(settings: &Settings) -> Result<()> {
    let (_template, mut tree) = load_trees(settings)?;

    let cancel = CancellationToken::new();
    let supervisor = ProcessSupervisor::new(false, cancel.clone());
    let bus: Arc<dyn CallBus> = Arc::new(UnconnectedBus);
    let mut engine = CommitEngine::new(TaskManager::new(bus, supervisor, false));
    engine.verify(&mut tree).await?;
    cancel.cancel();

    println!("Configuration is valid");
    Ok(())
}

async fn run(settings: Settings) -> Result<()> {
    tracing::info!("RouteKit manager starting");

    let (_template, mut tree) = load_trees(&settings)?;

    // Root cancellation token; OS signals drive it.
    let cancel = CancellationToken::new();
    let cancel_for_signals = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        tracing::info!("shutdown signal received");
        cancel_for_signals.cancel();
    });

    let supervisor = ProcessSupervisor::new(settings.restart_failed_modules, cancel.clone());

    // The concrete remote-call transport is deployment-specific; without
    // one, only verification-style commits can succeed.
    let bus: Arc<dyn CallBus> = Arc::new(UnconnectedBus);
    if settings.execute {
        tracing::warn!("no remote-call transport configured");
    }

    let task_manager = TaskManager::new(bus, Arc::clone(&supervisor), settings.execute);
    let mut engine = CommitEngine::new(task_manager);

    engine
        .commit(&mut tree)
        .await
        .context("initial configuration commit failed")?;
    tracing::info!("boot configuration committed");

    cancel.cancelled().await;

    supervisor.shutdown().await;
    if !supervisor.is_shutdown_completed() {
        tracing::warn!("shutdown left modules behind");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM; falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
