// src/scheduler/mod.rs

//! Per-stage scheduling.
//!
//! The [`Scheduler`] turns the ready input groups reported by a
//! [`StageStrategy`] into planned output products, one planned job per group
//! and the provenance relationships linking them.
//!
//! - [`report`] holds the structured result of a pass.

pub mod report;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::StageConfig;
use crate::errors::{ReductorError, Result};
use crate::model::{JobState, Product, ProductId, ProductState};
use crate::stage::StageStrategy;
use crate::store::{JobFilter, Store, Transaction};

pub use report::{ScheduleReport, ScheduledGroup, SkipReason};

/// Per-invocation scheduling switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Mark each input `progressed` once its group is scheduled.
    pub mark_inputs_progressed: bool,
    /// Link inputs to outputs positionally instead of all-to-all.
    pub children_one_to_one: bool,
}

impl ScheduleOptions {
    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            mark_inputs_progressed: config.mark_inputs_progressed,
            children_one_to_one: config.children_one_to_one,
        }
    }
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            mark_inputs_progressed: true,
            children_one_to_one: false,
        }
    }
}

/// Schedules jobs for one stage at a time.
///
/// Concurrent passes over the *same* stage must not overlap; passes over
/// different stages touch disjoint rows.
pub struct Scheduler<'a> {
    store: &'a dyn Store,
}

impl<'a> Scheduler<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Run one scheduling pass for `stage`.
    ///
    /// Each input group is committed in its own transaction. An error aborts
    /// the group being processed and is returned; groups committed before it
    /// stay committed.
    pub fn schedule(
        &self,
        stage: &str,
        config: &StageConfig,
        strategy: &dyn StageStrategy,
        options: ScheduleOptions,
        reference_time: DateTime<Utc>,
    ) -> Result<ScheduleReport> {
        if !config.enabled {
            debug!(stage = %stage, "stage disabled; skipping scheduling");
            return Ok(ScheduleReport::skipped(stage, SkipReason::Disabled));
        }

        let (groups, impossible) = {
            let tx = self.store.begin()?;

            if let Some(max) = config.max_in_flight {
                let in_flight =
                    tx.count_jobs(&JobFilter::in_states(&JobState::IN_FLIGHT).stage(stage))?;
                if in_flight >= max {
                    info!(
                        stage = %stage,
                        in_flight,
                        max,
                        "in-flight ceiling reached; skipping scheduling"
                    );
                    return Ok(ScheduleReport::skipped(
                        stage,
                        SkipReason::InFlightCeiling { in_flight, max },
                    ));
                }
            }

            let groups = strategy.find_ready_inputs(tx.as_read(), config, reference_time)?;
            let impossible =
                strategy.find_impossible_inputs(tx.as_read(), config, reference_time)?;
            (groups, impossible)
        };

        let mut report = ScheduleReport::new(stage);

        if !impossible.is_empty() {
            report.marked_impossible = self.mark_impossible(stage, &impossible)?;
        }

        debug!(stage = %stage, groups = groups.len(), "ready input groups found");

        for group in groups {
            let mut tx = self.store.begin()?;
            let scheduled = schedule_group(
                &mut *tx,
                stage,
                &group,
                config,
                strategy,
                options,
                reference_time,
            )?;
            tx.commit()?;

            info!(
                stage = %stage,
                job_id = scheduled.job_id,
                inputs = ?scheduled.inputs,
                outputs = ?scheduled.outputs,
                "scheduled job"
            );
            report.scheduled.push(scheduled);
        }

        Ok(report)
    }

    fn mark_impossible(&self, stage: &str, ids: &[ProductId]) -> Result<Vec<ProductId>> {
        let mut tx = self.store.begin()?;
        let mut marked = Vec::with_capacity(ids.len());

        for &id in ids {
            let Some(mut product) = tx.product(id)? else {
                warn!(stage = %stage, product_id = id, "impossible product not found; ignoring");
                continue;
            };
            if product.state != ProductState::Impossible {
                product.state = ProductState::Impossible;
                tx.update_product(&product)?;
                marked.push(id);
            }
        }

        tx.commit()?;
        if !marked.is_empty() {
            info!(stage = %stage, products = ?marked, "marked products impossible");
        }
        Ok(marked)
    }
}

/// Create outputs, job and relationships for one input group inside `tx`.
fn schedule_group(
    tx: &mut dyn Transaction,
    stage: &str,
    group: &[ProductId],
    config: &StageConfig,
    strategy: &dyn StageStrategy,
    options: ScheduleOptions,
    reference_time: DateTime<Utc>,
) -> Result<ScheduledGroup> {
    if group.is_empty() {
        return Err(invalid(stage, "empty input group"));
    }

    let mut inputs = Vec::with_capacity(group.len());
    for &id in group {
        let product = tx.product(id)?.ok_or(ReductorError::ProductNotFound(id))?;
        inputs.push(product);
    }

    if options.mark_inputs_progressed {
        for input in inputs.iter_mut() {
            input.state = ProductState::Progressed;
            tx.update_product(input)?;
        }
    }

    let planned = strategy.make_outputs(&inputs, config, reference_time)?;
    if planned.is_empty() {
        return Err(invalid(stage, "strategy produced no outputs"));
    }
    if options.children_one_to_one && planned.len() != inputs.len() {
        return Err(invalid(
            stage,
            &format!(
                "one-to-one linking needs as many outputs as inputs ({} != {})",
                planned.len(),
                inputs.len()
            ),
        ));
    }

    let mut outputs: Vec<Product> = Vec::with_capacity(planned.len());
    for mut new in planned {
        new.state = ProductState::Planned;
        new.producing_job_id = None;
        let id = tx.insert_product(new)?;
        outputs.push(tx.product(id)?.ok_or(ReductorError::ProductNotFound(id))?);
    }

    let job = strategy.make_job(&inputs, &outputs, config, reference_time)?;
    let job_id = tx.insert_job(job)?;

    for output in outputs.iter_mut() {
        output.producing_job_id = Some(job_id);
        tx.update_product(output)?;
    }

    let mut relationships = 0;
    if options.children_one_to_one {
        for (input, output) in inputs.iter().zip(outputs.iter()) {
            tx.insert_relationship(input.id, output.id)?;
            relationships += 1;
        }
    } else {
        for input in inputs.iter() {
            for output in outputs.iter() {
                tx.insert_relationship(input.id, output.id)?;
                relationships += 1;
            }
        }
    }

    Ok(ScheduledGroup {
        job_id,
        inputs: inputs.iter().map(|p| p.id).collect(),
        outputs: outputs.iter().map(|p| p.id).collect(),
        relationships,
    })
}

fn invalid(stage: &str, reason: &str) -> ReductorError {
    ReductorError::InvalidGroup {
        stage: stage.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewJob, NewProduct, ProductKey};
    use crate::store::{MemoryStore, ProductFilter, StoreRead};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn key(stage: &str, source: &str) -> ProductKey {
        ProductKey {
            stage: stage.into(),
            product_type: "img".into(),
            source: source.into(),
            version: 1,
            observation_time: t0(),
        }
    }

    /// Every `created` l0 product is its own group; one l1 output per input.
    struct PerInput {
        outputs_per_group: usize,
    }

    impl StageStrategy for PerInput {
        fn find_ready_inputs(
            &self,
            store: &dyn StoreRead,
            _config: &StageConfig,
            _reference_time: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Vec<ProductId>>> {
            let ready = store.find_products(&ProductFilter::stage("l0").state(ProductState::Created))?;
            Ok(ready.into_iter().map(|p| vec![p.id]).collect())
        }

        fn make_outputs(
            &self,
            inputs: &[Product],
            _config: &StageConfig,
            reference_time: DateTime<Utc>,
        ) -> anyhow::Result<Vec<NewProduct>> {
            Ok((0..self.outputs_per_group)
                .map(|i| {
                    NewProduct::planned(
                        key("l1", &format!("{}-{i}", inputs[0].source)),
                        reference_time,
                    )
                })
                .collect())
        }

        fn make_job(
            &self,
            inputs: &[Product],
            _outputs: &[Product],
            config: &StageConfig,
            reference_time: DateTime<Utc>,
        ) -> anyhow::Result<NewJob> {
            let ids: Vec<_> = inputs.iter().map(|p| p.id).collect();
            Ok(NewJob::new("l1", "img", &serde_json::json!({ "inputs": ids }), reference_time)
                .with_priority(config.default_priority))
        }
    }

    fn seed(store: &MemoryStore, sources: &[&str]) {
        let mut tx = store.begin().unwrap();
        for source in sources {
            tx.insert_product(
                NewProduct::planned(key("l0", source), t0()).with_state(ProductState::Created),
            )
            .unwrap();
        }
        tx.commit().unwrap();
    }

    #[test]
    fn disabled_stage_is_skipped_without_reading_inputs() {
        let store = MemoryStore::new();
        seed(&store, &["a"]);
        let config = StageConfig {
            enabled: false,
            ..StageConfig::default()
        };

        let report = Scheduler::new(&store)
            .schedule("l1", &config, &PerInput { outputs_per_group: 1 }, ScheduleOptions::default(), t0())
            .unwrap();

        assert_eq!(report.skipped, Some(SkipReason::Disabled));
        assert!(store.jobs().unwrap().is_empty());
    }

    #[test]
    fn in_flight_ceiling_skips_the_whole_pass() {
        let store = MemoryStore::new();
        seed(&store, &["a", "b", "c"]);
        let config = StageConfig {
            max_in_flight: Some(1),
            ..StageConfig::default()
        };
        let strategy = PerInput { outputs_per_group: 1 };
        let scheduler = Scheduler::new(&store);

        // Under the ceiling: every ready group is scheduled in one pass.
        let first = scheduler
            .schedule("l1", &config, &strategy, ScheduleOptions::from_config(&config), t0())
            .unwrap();
        assert_eq!(first.jobs_created(), 3);

        seed(&store, &["d"]);
        let second = scheduler
            .schedule("l1", &config, &strategy, ScheduleOptions::from_config(&config), t0())
            .unwrap();
        assert_eq!(
            second.skipped,
            Some(SkipReason::InFlightCeiling { in_flight: 3, max: 1 })
        );
        assert_eq!(store.jobs().unwrap().len(), 3);
    }

    #[test]
    fn one_to_one_links_positionally() {
        let store = MemoryStore::new();
        seed(&store, &["a"]);
        let options = ScheduleOptions {
            mark_inputs_progressed: false,
            children_one_to_one: true,
        };

        let report = Scheduler::new(&store)
            .schedule("l1", &StageConfig::default(), &PerInput { outputs_per_group: 1 }, options, t0())
            .unwrap();

        let group = &report.scheduled[0];
        assert_eq!(group.relationships, 1);
        let rels = store.relationships().unwrap();
        assert_eq!((rels[0].parent_id, rels[0].child_id), (group.inputs[0], group.outputs[0]));

        let input = &store.products().unwrap()[0];
        assert_eq!(input.state, ProductState::Created, "inputs left untouched");
    }

    #[test]
    fn one_to_one_with_mismatched_counts_rolls_back_the_group() {
        let store = MemoryStore::new();
        seed(&store, &["a"]);
        let options = ScheduleOptions {
            mark_inputs_progressed: true,
            children_one_to_one: true,
        };

        let err = Scheduler::new(&store)
            .schedule("l1", &StageConfig::default(), &PerInput { outputs_per_group: 2 }, options, t0())
            .unwrap_err();

        assert!(matches!(err, ReductorError::InvalidGroup { .. }));
        let products = store.products().unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].state, ProductState::Created);
        assert!(store.jobs().unwrap().is_empty());
    }

    #[test]
    fn outputs_always_reference_their_job() {
        let store = MemoryStore::new();
        seed(&store, &["a", "b"]);

        Scheduler::new(&store)
            .schedule("l1", &StageConfig::default(), &PerInput { outputs_per_group: 2 }, ScheduleOptions::default(), t0())
            .unwrap();

        let jobs = store.jobs().unwrap();
        for product in store.products().unwrap() {
            if let Some(job_id) = product.producing_job_id {
                assert!(jobs.iter().any(|j| j.id == job_id));
            } else {
                assert_eq!(product.stage, "l0");
            }
        }
    }
}
