// src/cleaner/revival.rs

//! Revival planning.
//!
//! The whole revivable set is evaluated before anything is mutated, so a
//! parent shared by several revived children is reset exactly once, whatever
//! order the jobs are visited in.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ConfigFile;
use crate::errors::Result;
use crate::model::{JobId, JobState, Product, ProductId};
use crate::store::{JobFilter, StoreRead};

/// Everything one revival pass will change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevivalPlan {
    /// Revivable jobs, deleted last.
    pub jobs: Vec<JobId>,
    /// Outputs of those jobs; their artifacts, relationships and rows go.
    pub children: Vec<Product>,
    /// Inputs that become `created` again.
    pub parents_to_reset: BTreeSet<ProductId>,
}

impl RevivalPlan {
    pub fn build(store: &dyn StoreRead, config: &ConfigFile) -> Result<Self> {
        let jobs = store.find_jobs(&JobFilter::in_state(JobState::Revivable))?;

        let mut children: BTreeMap<ProductId, Product> = BTreeMap::new();
        let mut candidates = BTreeSet::new();

        for job in &jobs {
            let preserves_parents = config
                .stage(&job.stage)
                .is_some_and(|stage| stage.preserves_parents);

            for child in store.products_for_job(job.id)? {
                if !preserves_parents {
                    for edge in store.relationships_for_child(child.id)? {
                        candidates.insert(edge.parent_id);
                    }
                }
                children.insert(child.id, child);
            }
        }

        let parents_to_reset = candidates
            .into_iter()
            .filter(|parent| !children.contains_key(parent))
            .collect();

        Ok(Self {
            jobs: jobs.iter().map(|job| job.id).collect(),
            children: children.into_values().collect(),
            parents_to_reset,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawConfigFile, StageConfig};
    use crate::model::{NewJob, NewProduct, ProductKey};
    use crate::store::{MemoryStore, Store};
    use chrono::{TimeZone, Utc};

    fn config(preserving: &[&str]) -> ConfigFile {
        let mut raw: RawConfigFile = toml::from_str("").unwrap();
        for stage in ["l0", "l1", "bg"] {
            raw.stage.insert(
                stage.to_string(),
                StageConfig {
                    preserves_parents: preserving.contains(&stage),
                    ..StageConfig::default()
                },
            );
        }
        ConfigFile::try_from(raw).unwrap()
    }

    fn key(stage: &str, source: &str) -> ProductKey {
        ProductKey {
            stage: stage.into(),
            product_type: "img".into(),
            source: source.into(),
            version: 1,
            observation_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    /// One created input shared by two revivable jobs of `stage`.
    fn shared_parent(store: &MemoryStore, stage: &str) -> ProductId {
        let now = Utc::now();
        let mut tx = store.begin().unwrap();
        let parent = tx.insert_product(NewProduct::planned(key("l0", "p"), now)).unwrap();
        for source in ["a", "b"] {
            let job_id = tx
                .insert_job(NewJob::new(stage, "img", &serde_json::Value::Null, now))
                .unwrap();
            let mut job = tx.job(job_id).unwrap().unwrap();
            job.state = JobState::Revivable;
            tx.update_job(&job).unwrap();

            let mut child = NewProduct::planned(key(stage, source), now);
            child.producing_job_id = Some(job_id);
            let child = tx.insert_product(child).unwrap();
            tx.insert_relationship(parent, child).unwrap();
        }
        tx.commit().unwrap();
        parent
    }

    #[test]
    fn shared_parent_is_reset_once() {
        let store = MemoryStore::new();
        let parent = shared_parent(&store, "l1");

        let tx = store.begin().unwrap();
        let plan = RevivalPlan::build(tx.as_read(), &config(&[])).unwrap();

        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.children.len(), 2);
        assert_eq!(plan.parents_to_reset, BTreeSet::from([parent]));
    }

    #[test]
    fn preserving_stage_leaves_parents_alone() {
        let store = MemoryStore::new();
        shared_parent(&store, "bg");

        let tx = store.begin().unwrap();
        let plan = RevivalPlan::build(tx.as_read(), &config(&["bg"])).unwrap();

        assert_eq!(plan.children.len(), 2);
        assert!(plan.parents_to_reset.is_empty());
    }

    #[test]
    fn nothing_revivable_gives_empty_plan() {
        let store = MemoryStore::new();
        let tx = store.begin().unwrap();
        let plan = RevivalPlan::build(tx.as_read(), &config(&[])).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan, RevivalPlan::default());
    }
}
