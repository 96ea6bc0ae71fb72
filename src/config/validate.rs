// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{ReductorError, Result};

/// Largest accepted `max_wait_minutes_*` value: one hundred years.
pub const MAX_WAIT_MINUTES: i64 = 100 * 366 * 24 * 60;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::ReductorError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        let order = stage_order(&raw)?;
        Ok(ConfigFile::new_unchecked(raw, order))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_stages(cfg)?;
    validate_launcher(cfg)?;
    validate_cleaner(cfg)?;
    validate_stage_dependencies(cfg)?;
    validate_escalation(cfg)?;
    validate_wait_limits(cfg)?;
    Ok(())
}

fn ensure_has_stages(cfg: &RawConfigFile) -> Result<()> {
    if cfg.stage.is_empty() {
        return Err(ReductorError::ConfigError(
            "config must contain at least one [stage.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_launcher(cfg: &RawConfigFile) -> Result<()> {
    let l = &cfg.launcher;

    if l.max_launch_per_cycle == 0 {
        return Err(ReductorError::ConfigError(
            "[launcher].max_launch_per_cycle must be >= 1 (got 0)".to_string(),
        ));
    }
    if l.slice_seconds == 0 {
        return Err(ReductorError::ConfigError(
            "[launcher].slice_seconds must be >= 1 (got 0)".to_string(),
        ));
    }
    if l.min_batch_size == 0 {
        return Err(ReductorError::ConfigError(
            "[launcher].min_batch_size must be >= 1 (got 0)".to_string(),
        ));
    }
    if l.release_deadline_seconds > l.interval_seconds {
        return Err(ReductorError::ConfigError(format!(
            "[launcher].release_deadline_seconds ({}) exceeds interval_seconds ({})",
            l.release_deadline_seconds, l.interval_seconds
        )));
    }
    if l.safety_margin_seconds >= l.release_deadline_seconds {
        return Err(ReductorError::ConfigError(format!(
            "[launcher].safety_margin_seconds ({}) must be below release_deadline_seconds ({})",
            l.safety_margin_seconds, l.release_deadline_seconds
        )));
    }
    Ok(())
}

fn validate_cleaner(cfg: &RawConfigFile) -> Result<()> {
    if cfg.cleaner.cancel_batch_size == 0 {
        return Err(ReductorError::ConfigError(
            "[cleaner].cancel_batch_size must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_stage_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (name, stage) in cfg.stage.iter() {
        for up in stage.upstream.iter() {
            if !cfg.stage.contains_key(up) {
                return Err(ReductorError::ConfigError(format!(
                    "stage '{}' has unknown upstream stage '{}'",
                    name, up
                )));
            }
            if up == name {
                return Err(ReductorError::ConfigError(format!(
                    "stage '{}' cannot list itself in `upstream`",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn validate_escalation(cfg: &RawConfigFile) -> Result<()> {
    for (name, stage) in cfg.stage.iter() {
        if let Some(tier) = stage.escalation.iter().find(|t| t.wait_seconds < 0) {
            return Err(ReductorError::ConfigError(format!(
                "stage '{}' has a negative escalation threshold ({}s)",
                name, tier.wait_seconds
            )));
        }
    }
    Ok(())
}

fn validate_wait_limits(cfg: &RawConfigFile) -> Result<()> {
    for (name, stage) in cfg.stage.iter() {
        for (field, minutes) in [
            ("max_wait_minutes_launched", stage.max_wait_minutes_launched),
            ("max_wait_minutes_running", stage.max_wait_minutes_running),
        ] {
            if minutes > MAX_WAIT_MINUTES {
                return Err(ReductorError::ConfigError(format!(
                    "stage '{}' {} ({}) exceeds the maximum of {} minutes; use -1 for no limit",
                    name, field, minutes, MAX_WAIT_MINUTES
                )));
            }
        }
    }
    Ok(())
}

/// Topological order of the stages.
///
/// Edge direction: upstream -> stage. For
///   [stage.l1]
///   upstream = ["l0"]
/// we add edge l0 -> l1.
fn stage_order(cfg: &RawConfigFile) -> Result<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.stage.keys() {
        graph.add_node(name.as_str());
    }

    for (name, stage) in cfg.stage.iter() {
        for up in stage.upstream.iter() {
            graph.add_edge(up.as_str(), name.as_str(), ());
        }
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => {
            let node = cycle.node_id();
            Err(ReductorError::DagCycle(format!(
                "cycle detected in stage graph involving stage '{}'",
                node
            )))
        }
    }
}
