pub mod api;
pub mod calibration;
mod console;
pub mod db;
pub mod display;
pub mod flags;
pub mod launch;
pub mod lifecycle;
pub mod models;
pub mod poller;
pub mod relay;
pub mod settings;
#[cfg(test)]
mod testing;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use api::HttpBackend;
use console::ConsoleCommand;
use db::Database;
use flags::{AnyFlagStore, MemoryFlagStore, SqliteFlagStore};
use launch::LaunchContext;
use lifecycle::{Coordinator, CoordinatorConfig, LifecyclePhase};
use settings::ClientSettings;

#[derive(Debug, Parser)]
#[command(name = "posture-monitor", version, about = "Posture monitoring client")]
pub struct LaunchArgs {
    /// Launch URL or bare query, e.g. `http://10.0.0.5/?device_id=esp-1&forceCalib=1`
    #[arg(long, env = "POSTURE_LAUNCH", default_value = "")]
    pub launch: String,

    /// JSON settings file
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Keep flags in memory only
    #[arg(long)]
    pub ephemeral: bool,

    #[arg(long)]
    pub no_video: bool,
}

pub async fn run(args: LaunchArgs) -> Result<()> {
    // RUST_LOG overrides the default level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("posture monitor starting up...");

    let mut settings = ClientSettings::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        settings.data_dir = dir;
    }
    if args.no_video {
        settings.video_enabled = false;
    }

    let launch = LaunchContext::parse(&args.launch)?;
    let endpoints = settings.resolve_endpoints(&launch)?;

    let flags = if args.ephemeral {
        AnyFlagStore::Memory(MemoryFlagStore::new())
    } else {
        let database = Database::new(settings.database_path())?;
        AnyFlagStore::Sqlite(SqliteFlagStore::new(database))
    };

    let api = Arc::new(HttpBackend::new(
        endpoints.api_base.clone(),
        settings.request_timeout(),
    )?);
    info!(
        "backend {} | video {}",
        api.base_url(),
        endpoints
            .stream
            .as_ref()
            .map(|url| url.to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );

    let root = CancellationToken::new();
    let (coordinator, coordinator_task) = Coordinator::spawn(
        CoordinatorConfig::new(&settings, &launch, &endpoints),
        api.clone(),
        Arc::new(flags),
        &root,
    );
    let board = display::spawn(
        api,
        launch.device_id.clone(),
        settings.poll.clone(),
        settings.request_timeout(),
        coordinator.subscribe(),
        &root,
    );

    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut snapshots = coordinator.subscribe();
    let mut last_phase: Option<LifecyclePhase> = None;
    let mut last_alert: Option<String> = None;
    let mut restart_announced = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        stdin_open = false;
                        continue;
                    }
                    Err(err) => {
                        warn!("stdin read failed: {err}");
                        stdin_open = false;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match ConsoleCommand::parse(&line) {
                    Some(ConsoleCommand::Restart) => coordinator.request_restart()?,
                    Some(ConsoleCommand::Proceed) => coordinator.proceed()?,
                    Some(ConsoleCommand::Status) => {
                        let frame = coordinator.frames().latest();
                        let report = console::status_report(
                            &coordinator.snapshot(),
                            &board.state(),
                            frame.as_ref(),
                        );
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    }
                    Some(ConsoleCommand::Quit) => break,
                    None => println!("{}", console::HELP),
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if last_phase != Some(snapshot.phase) {
                    println!("phase: {}", snapshot.phase.as_str());
                    last_phase = Some(snapshot.phase);
                }
                if snapshot.alert.is_some() && snapshot.alert != last_alert {
                    println!("alert: {}", snapshot.alert.as_deref().unwrap_or_default());
                }
                if snapshot.device_restart_required && !restart_announced {
                    println!("calibration saved: restart the device, then relaunch the client");
                    restart_announced = true;
                }
                last_alert = snapshot.alert;
            }
            _ = &mut ctrl_c => {
                info!("interrupt received");
                break;
            }
        }
    }

    info!("shutting down...");
    coordinator.shutdown();
    root.cancel();
    coordinator_task
        .await
        .context("coordinator task failed to join")?;
    Ok(())
}
