use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bookshift::kobo::{DeviceLibrary, KoboDevice, Uninstaller};
use bookshift::rescan::RescanOutcome;
use bookshift::{Config, RunOptions, SyncEngine, SyncSummary};

#[derive(Parser)]
#[command(name = "bookshift")]
#[command(about = "Download e-books from network shares and mailboxes to your e-reader")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to ./config.yaml, then the XDG config location)
    #[arg(short, long, env = "BOOKSHIFT_CONFIG_FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download new e-books from every configured source
    Run {
        /// Log what would happen without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Do not draw download progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Kobo e-reader helpers
    Kobo {
        #[command(subcommand)]
        kobo_command: KoboCommands,
    },
}

#[derive(Subcommand)]
enum KoboCommands {
    /// Ask Nickel to rescan its library
    UpdateLibrary,

    /// Remove BookShift from the device
    Uninstall {
        /// Show what would be removed
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            dry_run,
            no_progress,
        } => {
            let config = load_config(cli.config)?;
            init_logging(cli.verbose, &config.log_level)?;
            info!("Starting BookShift v{}", env!("CARGO_PKG_VERSION"));

            cmd_run(
                config,
                RunOptions {
                    dry_run,
                    show_progress: !no_progress,
                },
            )
            .await
        }
        Commands::Kobo { kobo_command } => match kobo_command {
            KoboCommands::UpdateLibrary => {
                let config = load_optional_config(cli.config)?;
                init_logging(cli.verbose, &config.log_level)?;
                cmd_update_library(&config).await
            }
            KoboCommands::Uninstall { dry_run } => {
                init_logging(cli.verbose, "info")?;
                cmd_uninstall(dry_run)
            }
        },
    }
}

/// Initialize logging; RUST_LOG wins over --verbose, which wins over the config level
fn init_logging(verbose: bool, level: &str) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from the given path or the default locations
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let path = Config::resolve_path(config_path)?;
    Config::load(&path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

/// Like [`load_config`], but a missing default config file is not an error
fn load_optional_config(config_path: Option<PathBuf>) -> Result<Config> {
    if config_path.is_some() {
        return load_config(config_path);
    }

    let path = Config::resolve_path(None)?;
    if path.exists() {
        load_config(Some(path))
    } else {
        Ok(Config::default())
    }
}

/// Cancelled on Ctrl+C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, stopping after the current files");
        trigger.cancel();
    });

    token
}

/// Wait for shutdown signals (SIGTERM, SIGINT, Ctrl+C)
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Run one sync pass over every configured source
async fn cmd_run(config: Config, options: RunOptions) -> Result<()> {
    if options.dry_run {
        println!("🔍 Dry run mode - nothing will be downloaded or deleted");
    }

    if config.sources.is_empty() {
        println!("⚠️  No sources configured");
    }

    let cancel = shutdown_token();
    let engine = SyncEngine::new(config, options);
    let summary = engine.run(&cancel).await.context("Sync failed")?;

    print_summary(&summary);

    if summary.cancelled {
        bail!("Sync was interrupted");
    }

    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!("\n🎉 Sync Complete!");
    println!(
        "   📚 Books in target folder: {} → {}",
        summary.files_before, summary.files_after
    );
    println!("   📥 New books: {}", summary.books_added());
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    for report in &summary.sources {
        match &report.result {
            Ok(stats) => println!(
                "   ✅ {}: {} downloaded, {} skipped, {} deleted",
                report.label, stats.downloaded, stats.skipped, stats.deleted
            ),
            Err(e) => println!("   ❌ {}: {}", report.label, e),
        }
    }

    match summary.rescan {
        Some(RescanOutcome::Rescanned) => println!("   🔄 Library rescanned"),
        Some(RescanOutcome::HotplugSimulated) => println!("   🔌 Library refresh via USB replug"),
        None => {}
    }
}

/// Ask the device to rescan its library, without the device check
async fn cmd_update_library(config: &Config) -> Result<()> {
    let device = KoboDevice::from_config(&config.kobo);
    let cancel = shutdown_token();

    let outcome = device
        .update_library(&cancel)
        .await
        .context("Could not update library")?;

    match outcome {
        RescanOutcome::Rescanned => println!("✅ Library rescanned"),
        RescanOutcome::HotplugSimulated => println!("✅ Library refresh triggered via USB replug"),
    }

    Ok(())
}

/// Remove the installed files from the device
fn cmd_uninstall(dry_run: bool) -> Result<()> {
    let removed = Uninstaller::default()
        .run(dry_run)
        .context("Failed to uninstall BookShift")?;

    if removed.is_empty() {
        println!("Nothing to remove");
    }
    for path in &removed {
        if dry_run {
            println!("   Would remove {}", path.display());
        } else {
            println!("   🗑️  Removed {}", path.display());
        }
    }

    Ok(())
}
