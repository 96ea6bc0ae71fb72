// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [storage]
/// root = "/data/reductor"
/// database = "/var/lib/reductor/reductor.db"
///
/// [launcher]
/// max_running = 40
/// max_launch_per_cycle = 20
///
/// [cleaner]
/// interval_seconds = 300
///
/// [stage.l1]
/// upstream = ["l0"]
/// max_in_flight = 100
/// escalation = [{ wait_seconds = 3600, priority = 50 }]
/// ```
///
/// All sections except `[stage.<name>]` are optional and have defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub cleaner: CleanerConfig,

    /// All stages from `[stage.<name>]`, keyed by stage name.
    #[serde(default)]
    pub stage: BTreeMap<String, StageConfig>,
}

/// Validated configuration. Construct with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub storage: StorageConfig,
    pub launcher: LauncherConfig,
    pub cleaner: CleanerConfig,
    pub stage: BTreeMap<String, StageConfig>,
    stage_order: Vec<String>,
}

impl ConfigFile {
    /// Assemble a config whose invariants were already checked.
    pub(crate) fn new_unchecked(raw: RawConfigFile, stage_order: Vec<String>) -> Self {
        Self {
            storage: raw.storage,
            launcher: raw.launcher,
            cleaner: raw.cleaner,
            stage: raw.stage,
            stage_order,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stage.get(name)
    }

    /// Stage names with every stage listed after all of its upstream stages.
    pub fn stage_order(&self) -> &[String] {
        &self.stage_order
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the artifact tree. Never removed by the cleaner.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// SQLite file holding products, jobs and relationships.
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_database() -> PathBuf {
    PathBuf::from("reductor.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            database: default_database(),
        }
    }
}

/// `[launcher]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    /// Ceiling on concurrently running jobs across all stages.
    #[serde(default = "default_max_running")]
    pub max_running: usize,

    #[serde(default = "default_max_launch_per_cycle")]
    pub max_launch_per_cycle: usize,

    /// Length of one scheduling cycle.
    #[serde(default = "default_launch_interval")]
    pub interval_seconds: u64,

    /// Offset into the cycle by which all releases should be done.
    #[serde(default = "default_release_deadline")]
    pub release_deadline_seconds: u64,

    #[serde(default = "default_safety_margin")]
    pub safety_margin_seconds: u64,

    #[serde(default = "default_slice_seconds")]
    pub slice_seconds: u64,

    /// Smallest batch released in one slice.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
}

fn default_max_running() -> usize {
    40
}

fn default_max_launch_per_cycle() -> usize {
    20
}

fn default_launch_interval() -> u64 {
    60
}

fn default_release_deadline() -> u64 {
    50
}

fn default_safety_margin() -> u64 {
    5
}

fn default_slice_seconds() -> u64 {
    5
}

fn default_min_batch_size() -> usize {
    5
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            max_running: default_max_running(),
            max_launch_per_cycle: default_max_launch_per_cycle(),
            interval_seconds: default_launch_interval(),
            release_deadline_seconds: default_release_deadline(),
            safety_margin_seconds: default_safety_margin(),
            slice_seconds: default_slice_seconds(),
            min_batch_size: default_min_batch_size(),
        }
    }
}

/// `[cleaner]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanerConfig {
    #[serde(default = "default_cleaner_interval")]
    pub interval_seconds: u64,

    /// Cancellation requests issued together before pausing.
    #[serde(default = "default_cancel_batch_size")]
    pub cancel_batch_size: usize,

    #[serde(default = "default_cancel_pause_ms")]
    pub cancel_pause_ms: u64,
}

fn default_cleaner_interval() -> u64 {
    300
}

fn default_cancel_batch_size() -> usize {
    10
}

fn default_cancel_pause_ms() -> u64 {
    500
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_cleaner_interval(),
            cancel_batch_size: default_cancel_batch_size(),
            cancel_pause_ms: default_cancel_pause_ms(),
        }
    }
}

/// One priority escalation tier: jobs planned for at least `wait_seconds`
/// get at least `priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EscalationTier {
    pub wait_seconds: i64,
    pub priority: i64,
}

/// `[stage.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// When false the scheduler skips this stage entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Stages whose products this stage consumes.
    #[serde(default)]
    pub upstream: Vec<String>,

    /// Ceiling on this stage's planned + launched + running jobs.
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    #[serde(default)]
    pub default_priority: i64,

    /// Mark inputs `progressed` once scheduled. Stages that reuse inputs
    /// across jobs (sliding windows) turn this off.
    #[serde(default = "default_true")]
    pub mark_inputs_progressed: bool,

    /// Link inputs to outputs positionally instead of all-to-all.
    #[serde(default)]
    pub children_one_to_one: bool,

    /// Revival of this stage's jobs leaves their inputs untouched.
    #[serde(default)]
    pub preserves_parents: bool,

    /// Minutes a job may stay `launched`; negative disables the timeout.
    #[serde(default = "default_disabled_wait")]
    pub max_wait_minutes_launched: i64,

    /// Minutes a job may stay `running`; negative disables the timeout.
    #[serde(default = "default_disabled_wait")]
    pub max_wait_minutes_running: i64,

    #[serde(default)]
    pub escalation: Vec<EscalationTier>,

    /// Stage-specific settings, interpreted only by the stage strategy.
    #[serde(default)]
    pub settings: toml::Table,
}

fn default_true() -> bool {
    true
}

fn default_disabled_wait() -> i64 {
    -1
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            upstream: Vec::new(),
            max_in_flight: None,
            default_priority: 0,
            mark_inputs_progressed: true,
            children_one_to_one: false,
            preserves_parents: false,
            max_wait_minutes_launched: default_disabled_wait(),
            max_wait_minutes_running: default_disabled_wait(),
            escalation: Vec::new(),
            settings: toml::Table::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_defaults_apply_when_fields_are_missing() {
        let raw: RawConfigFile = toml::from_str(
            r#"
[stage.l1]
upstream = ["l0"]
escalation = [{ wait_seconds = 60, priority = 5 }]

[stage.l1.settings]
window_hours = 6
"#,
        )
        .unwrap();

        let l1 = &raw.stage["l1"];
        assert!(l1.enabled);
        assert!(l1.mark_inputs_progressed);
        assert!(!l1.children_one_to_one);
        assert_eq!(l1.max_wait_minutes_running, -1);
        assert_eq!(
            l1.escalation,
            vec![EscalationTier {
                wait_seconds: 60,
                priority: 5
            }]
        );
        assert_eq!(
            l1.settings.get("window_hours").and_then(|v| v.as_integer()),
            Some(6)
        );
        assert_eq!(raw.launcher.max_running, 40);
        assert_eq!(raw.cleaner.cancel_batch_size, 10);
    }
}
