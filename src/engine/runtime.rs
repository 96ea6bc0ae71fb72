// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::cleaner::Cleaner;
use crate::config::ConfigFile;
use crate::errors::Result;
use crate::executor::ExecutorClient;
use crate::launcher::Launcher;
use crate::scheduler::{ScheduleOptions, Scheduler};
use crate::stage::StageRegistry;
use crate::store::Store;

use super::core::CoreRuntime;
use super::{CoreCommand, RuntimeEvent};

/// Drives scheduler, launcher and cleaner passes on timer ticks.
///
/// This is the IO shell around [`CoreRuntime`]: it owns the timers and the
/// event channel and performs the passes the core asks for. Passes run one
/// after another; a failing pass is logged and the loop continues.
pub struct Runtime<E: ExecutorClient + ?Sized> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    store: Arc<dyn Store>,
    stages: Arc<StageRegistry>,
    config: Arc<ConfigFile>,
    launcher: Launcher<E>,
    cleaner: Cleaner<E>,
}

impl<E: ExecutorClient + ?Sized> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorClient + ?Sized> Runtime<E> {
    pub fn new(
        core: CoreRuntime,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        store: Arc<dyn Store>,
        stages: Arc<StageRegistry>,
        config: Arc<ConfigFile>,
        launcher: Launcher<E>,
        cleaner: Cleaner<E>,
    ) -> Self {
        Self {
            core,
            event_rx,
            store,
            stages,
            config,
            launcher,
            cleaner,
        }
    }

    /// Main loop. Returns once the core asks to stop.
    pub async fn run(mut self) -> Result<()> {
        info!("reductor runtime started");

        let launch_period = Duration::from_secs(self.config.launcher.interval_seconds.max(1));
        let clean_period = Duration::from_secs(self.config.cleaner.interval_seconds.max(1));
        let mut launch_tick = interval_at(Instant::now() + launch_period, launch_period);
        let mut clean_tick = interval_at(Instant::now() + clean_period, clean_period);
        launch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        clean_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut event = RuntimeEvent::Started;
        loop {
            debug!(?event, "runtime received event");

            let step = self.core.step(event);
            for command in step.commands {
                self.execute_command(command).await;
            }

            if !step.keep_running {
                info!(rounds = self.core.rounds(), "core requested exit; stopping runtime");
                break;
            }

            event = tokio::select! {
                Some(event) = self.event_rx.recv() => event,
                _ = launch_tick.tick() => RuntimeEvent::LauncherTick,
                _ = clean_tick.tick() => RuntimeEvent::CleanerTick,
            };
        }

        info!("runtime exiting");
        Ok(())
    }

    async fn execute_command(&self, command: CoreCommand) {
        match command {
            CoreCommand::ScheduleStages => self.schedule_stages(),
            CoreCommand::Launch => {
                if let Err(err) = self.launcher.run_cycle(Utc::now()).await {
                    warn!(error = %err, "launch cycle failed");
                }
            }
            CoreCommand::Clean => {
                let report = self.cleaner.run_pass(Utc::now()).await;
                debug!(?report, "cleaner pass finished");
            }
        }
    }

    fn schedule_stages(&self) {
        let scheduler = Scheduler::new(self.store.as_ref());
        let now = Utc::now();

        for name in self.config.stage_order() {
            let Some(stage_config) = self.config.stage(name) else {
                continue;
            };
            let Some(stage) = self.stages.get(name) else {
                debug!(stage = %name, "no strategy registered; skipping");
                continue;
            };

            match scheduler.schedule(
                name,
                stage_config,
                stage.strategy.as_ref(),
                ScheduleOptions::from_config(stage_config),
                now,
            ) {
                Ok(report) if report.jobs_created() > 0 => {
                    info!(stage = %name, jobs = report.jobs_created(), "stage scheduled");
                }
                Ok(report) => debug!(stage = %name, skipped = ?report.skipped, "nothing scheduled"),
                Err(err) => warn!(stage = %name, error = %err, "scheduler pass failed"),
            }
        }
    }
}
