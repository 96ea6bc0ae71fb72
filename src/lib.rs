// src/lib.rs

pub mod cleaner;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod fs;
pub mod harness;
pub mod launcher;
pub mod logging;
pub mod model;
pub mod scheduler;
pub mod stage;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cleaner::Cleaner;
use crate::cli::CliArgs;
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::engine::{CoreRuntime, Runtime, RuntimeEvent, RuntimeOptions};
use crate::executor::LocalExecutor;
use crate::fs::{ArtifactLayout, FileSystem, RealFileSystem};
use crate::launcher::Launcher;
use crate::stage::StageRegistry;
use crate::store::{SqliteStore, Store};

/// High-level entry point used by `main.rs`. Runs without registered stages.
pub async fn run(args: CliArgs) -> Result<()> {
    run_with_stages(args, StageRegistry::new()).await
}

/// Entry point for pipelines that register their stages.
///
/// This wires together:
/// - config loading
/// - the SQLite store, filesystem and artifact layout
/// - the in-process executor
/// - launcher, cleaner and the periodic control loop
/// - Ctrl-C handling
pub async fn run_with_stages(args: CliArgs, stages: StageRegistry) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    if args.dry_run {
        print_dry_run(&cfg, &stages);
        return Ok(());
    }

    for name in cfg.stage_order() {
        if stages.get(name).is_none() {
            warn!(stage = %name, "stage configured but not registered; it will not be scheduled");
        }
    }

    let cfg = Arc::new(cfg);
    let stages = Arc::new(stages);
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg.storage.database)?);
    info!(database = ?cfg.storage.database, "store opened");
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let layout = ArtifactLayout::new(cfg.storage.root.clone());

    let executor = Arc::new(LocalExecutor::new(
        store.clone(),
        stages.clone(),
        fs.clone(),
        layout.clone(),
    ));
    let launcher = Launcher::new(store.clone(), executor.clone(), cfg.clone());
    let cleaner = Cleaner::new(store.clone(), executor.clone(), fs, layout, cfg.clone());

    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(8);

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    let core = CoreRuntime::new(RuntimeOptions {
        single_round: args.once,
    });
    let runtime = Runtime::new(core, rt_rx, store, stages, cfg, launcher, cleaner);
    runtime.run().await?;

    if args.once {
        info!("waiting for in-flight runs to finish");
        executor.wait_idle().await;
    }
    Ok(())
}

/// Simple dry-run output: print stages in scheduling order and their settings.
fn print_dry_run(cfg: &ConfigFile, stages: &StageRegistry) {
    println!("reductor dry-run");
    println!("  storage.root = {}", cfg.storage.root.display());
    println!("  storage.database = {}", cfg.storage.database.display());
    println!(
        "  launcher: max_running = {}, max_launch_per_cycle = {}, interval = {}s",
        cfg.launcher.max_running, cfg.launcher.max_launch_per_cycle, cfg.launcher.interval_seconds
    );
    println!(
        "  cleaner: interval = {}s, cancel_batch_size = {}",
        cfg.cleaner.interval_seconds, cfg.cleaner.cancel_batch_size
    );
    println!();

    println!("stages ({}):", cfg.stage.len());
    for name in cfg.stage_order() {
        let Some(stage) = cfg.stage(name) else {
            continue;
        };
        println!("  - {name}");
        if !stage.enabled {
            println!("      enabled: false");
        }
        if stages.get(name).is_none() {
            println!("      registered: false");
        }
        if !stage.upstream.is_empty() {
            println!("      upstream: {:?}", stage.upstream);
        }
        if let Some(max) = stage.max_in_flight {
            println!("      max_in_flight: {max}");
        }
        println!("      default_priority: {}", stage.default_priority);
        if !stage.mark_inputs_progressed {
            println!("      mark_inputs_progressed: false");
        }
        if stage.children_one_to_one {
            println!("      children_one_to_one: true");
        }
        if stage.preserves_parents {
            println!("      preserves_parents: true");
        }
        if stage.max_wait_minutes_launched >= 0 {
            println!("      max_wait_minutes_launched: {}", stage.max_wait_minutes_launched);
        }
        if stage.max_wait_minutes_running >= 0 {
            println!("      max_wait_minutes_running: {}", stage.max_wait_minutes_running);
        }
        for tier in &stage.escalation {
            println!(
                "      escalation: after {}s -> priority {}",
                tier.wait_seconds, tier.priority
            );
        }
    }

    debug!("dry-run complete (nothing executed)");
}
