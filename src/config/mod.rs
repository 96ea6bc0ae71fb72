// src/config/mod.rs

//! Configuration loading and validation for reductor.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate basic invariants like stage-graph acyclicity (`validate.rs`).
//!
//! Configuration is read once per invocation and passed down explicitly;
//! nothing in the control plane reads ambient global toggles.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, parse_raw};
pub use model::{
    CleanerConfig, ConfigFile, EscalationTier, LauncherConfig, RawConfigFile, StageConfig,
    StorageConfig,
};
