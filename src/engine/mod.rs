// src/engine/mod.rs

//! Periodic control loop.
//!
//! The loop reacts to:
//! - launcher ticks (scheduler passes for every stage, then a launch cycle)
//! - cleaner ticks (revival, timeouts, crashed runs)
//! - shutdown signals
//!
//! The pure decision logic lives in [`core`]; the async/IO shell that owns
//! the store, executor and timers is implemented in [`runtime`].

/// Work the control plane can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreCommand {
    /// One scheduler pass per stage, in stage order.
    ScheduleStages,
    /// One launcher cycle.
    Launch,
    /// One cleaner pass.
    Clean,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Run exactly one full round and exit (used for `--once`).
    pub single_round: bool,
}

/// Events flowing into the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// The loop has started.
    Started,
    LauncherTick,
    CleanerTick,
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod core;
pub mod runtime;

pub use core::CoreRuntime;
pub use runtime::Runtime;
