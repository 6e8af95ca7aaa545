use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use splitflash::cli::{console, prompt};
use splitflash::config::AppConfig;
use splitflash::context::AppContext;
use splitflash::core::orchestrator::error_chain;
use splitflash::core::{FirmwareCatalog, FirmwareSource, OperationMode, Orchestrator, events};
use splitflash::{adapters, logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "splitflash")]
#[command(about = "Flash UF2 firmware onto both halves of a split keyboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./splitflash.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use fake volumes driven from stdin instead of real USB drives
    #[arg(long, global = true)]
    simulation: bool,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware directory or ZIP archive
    Flash(FlashArgs),
    /// Show which firmware images were found and which modes they support
    Inspect { firmware_path: PathBuf },
    /// List mounted removable drives and unmounted USB FAT devices
    Drives,
}

#[derive(Args)]
struct FlashArgs {
    firmware_path: PathBuf,

    #[arg(long, value_enum)]
    mode: Option<OperationMode>,

    /// Seconds to wait for a half to appear as a drive
    #[arg(long)]
    new_drive_timeout: Option<u64>,

    /// Seconds to wait for a drive to disappear after writing
    #[arg(long)]
    removal_timeout: Option<u64>,

    #[arg(long)]
    eject_after_write: bool,
}

#[derive(Serialize, Default)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    simulation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<OperationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_drive_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    removal_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eject_after_write: Option<bool>,
}

impl Cli {
    /// Flags only override lower config layers when actually given.
    fn overrides(&self) -> Overrides {
        let mut overrides = Overrides {
            simulation: self.simulation.then_some(true),
            verbose: self.verbose.then_some(true),
            json_logs: self.json_logs.then_some(true),
            ..Default::default()
        };
        if let Commands::Flash(args) = &self.command {
            overrides.mode = args.mode;
            overrides.new_drive_timeout_secs = args.new_drive_timeout;
            overrides.removal_timeout_secs = args.removal_timeout;
            overrides.eject_after_write = args.eject_after_write.then_some(true);
        }
        overrides
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::new(cli.config.as_deref(), cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    logging::init(logging::LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let outcome = match cli.command {
        Commands::Flash(args) => run_flash(config, args.firmware_path)
            .await
            .context("Flashing aborted"),
        Commands::Inspect { firmware_path } => run_inspect(&firmware_path),
        Commands::Drives => run_drives(config.simulation).await,
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_flash(config: AppConfig, firmware_path: PathBuf) -> Result<bool> {
    let source = FirmwareSource::open(&firmware_path)?;
    let catalog = FirmwareCatalog::scan(source.dir())?;
    console::print_source(&mut io::stdout(), &source)?;
    console::print_catalog(&mut io::stdout(), &catalog)?;
    if catalog.images.is_empty() {
        return Ok(false);
    }

    let mode = match config.mode {
        Some(mode) => mode,
        None => {
            let stdin = io::stdin();
            match prompt::prompt_mode(&mut stdin.lock(), &mut io::stdout())? {
                Some(mode) => mode,
                None => return Ok(false),
            }
        }
    };
    println!("\nSelected mode: {}", mode.description());

    // Refuse early so no device is touched with an incomplete image set.
    if let Err(e) = mode.plan(&catalog.roles) {
        eprintln!("Error: {}", e);
        return Ok(false);
    }

    let (adapter, simulation) = adapters::get_adapter(config.simulation)?;
    if let Some(simulation) = &simulation {
        println!(
            "(Simulation) Type 'plug <label>', 'plug-unmounted <label>' or 'unplug <label>' to fake a USB drive"
        );
        simulation.spawn_stdin_controller();
    }

    let ctx = AppContext::new(config, adapter);
    let (events_tx, events_rx) = events::channel();
    let renderer = tokio::spawn(console::render_events(events_rx));

    let mut orchestrator = Orchestrator::from_context(&ctx, catalog.roles.clone(), events_tx)
        .await
        .context("Failed to start device monitor")?;
    let result = orchestrator.run(mode).await;

    // Closes the event channel so the renderer drains and exits.
    drop(orchestrator);
    let _ = renderer.await;

    match result {
        Ok(()) => {
            info!(mode = ?mode, "Flash run finished");
            println!("\n=== All firmware writes completed successfully ===");
            Ok(true)
        }
        Err(e) => {
            eprintln!("\n=== Firmware write process failed: {} ===", error_chain(&e));
            Ok(false)
        }
    }
}

fn run_inspect(firmware_path: &std::path::Path) -> Result<bool> {
    let source = FirmwareSource::open(firmware_path)?;
    let catalog = FirmwareCatalog::scan(source.dir())?;

    let mut out = io::stdout();
    console::print_source(&mut out, &source)?;
    console::print_catalog(&mut out, &catalog)?;

    writeln!(out, "\nSupported modes:")?;
    for mode in [
        OperationMode::UpdateRightOnly,
        OperationMode::UpdateBothWithoutReset,
        OperationMode::ResetAndUpdateBoth,
    ] {
        let mark = if mode.plan(&catalog.roles).is_ok() {
            "✓"
        } else {
            "✗"
        };
        writeln!(out, "  {} {}", mark, mode)?;
    }

    Ok(catalog.missing_roles().is_empty())
}

async fn run_drives(simulation: bool) -> Result<bool> {
    let (adapter, _simulation) = adapters::get_adapter(simulation)?;

    let (mounted, candidates) = tokio::task::spawn_blocking(move || {
        Ok::<_, anyhow::Error>((
            adapter.list_mounted_drives()?,
            adapter.list_unmounted_candidates()?,
        ))
    })
    .await
    .context("Drive listing task panicked")??;

    console::print_drives(&mut io::stdout(), &mounted, &candidates)?;
    Ok(true)
}
