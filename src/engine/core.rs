// src/engine/core.rs

//! Pure core of the control loop.
//!
//! Maps [`RuntimeEvent`]s to the commands the IO shell should run. No Tokio,
//! no store, no executor.

use crate::engine::{CoreCommand, CoreStep, RuntimeEvent, RuntimeOptions};

#[derive(Debug)]
pub struct CoreRuntime {
    options: RuntimeOptions,
    rounds: u64,
}

impl CoreRuntime {
    pub fn new(options: RuntimeOptions) -> Self {
        Self { options, rounds: 0 }
    }

    /// Launcher rounds started so far.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        match event {
            RuntimeEvent::Started => {
                self.rounds += 1;
                CoreStep {
                    commands: vec![
                        CoreCommand::ScheduleStages,
                        CoreCommand::Launch,
                        CoreCommand::Clean,
                    ],
                    keep_running: !self.options.single_round,
                }
            }
            RuntimeEvent::LauncherTick => {
                self.rounds += 1;
                CoreStep {
                    commands: vec![CoreCommand::ScheduleStages, CoreCommand::Launch],
                    keep_running: true,
                }
            }
            RuntimeEvent::CleanerTick => CoreStep {
                commands: vec![CoreCommand::Clean],
                keep_running: true,
            },
            RuntimeEvent::ShutdownRequested => CoreStep {
                commands: Vec::new(),
                keep_running: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_runs_a_full_round() {
        let mut core = CoreRuntime::new(RuntimeOptions::default());
        let step = core.step(RuntimeEvent::Started);
        assert_eq!(
            step.commands,
            vec![
                CoreCommand::ScheduleStages,
                CoreCommand::Launch,
                CoreCommand::Clean
            ]
        );
        assert!(step.keep_running);
        assert_eq!(core.rounds(), 1);
    }

    #[test]
    fn single_round_stops_after_start() {
        let mut core = CoreRuntime::new(RuntimeOptions { single_round: true });
        assert!(!core.step(RuntimeEvent::Started).keep_running);
    }

    #[test]
    fn ticks_map_to_their_component() {
        let mut core = CoreRuntime::new(RuntimeOptions::default());
        assert_eq!(
            core.step(RuntimeEvent::LauncherTick).commands,
            vec![CoreCommand::ScheduleStages, CoreCommand::Launch]
        );
        assert_eq!(
            core.step(RuntimeEvent::CleanerTick).commands,
            vec![CoreCommand::Clean]
        );
        let stop = core.step(RuntimeEvent::ShutdownRequested);
        assert!(stop.commands.is_empty());
        assert!(!stop.keep_running);
    }
}
