// src/stage/mod.rs

//! Per-stage plug-in points.
//!
//! Each pipeline stage registers one [`StageStrategy`] (what to schedule) and
//! one [`Transformation`] (what a job computes). The control plane only talks
//! to stages through these traits; it never inspects call parameters beyond
//! handing them over.
//!
//! - [`artifact`] defines what a transformation returns.
//! - [`params`] holds the default parameter post-processing hook.

pub mod artifact;
pub mod params;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::StageConfig;
use crate::model::{JobId, NewJob, NewProduct, Product, ProductId};
use crate::store::StoreRead;

pub use artifact::{Artifact, ArtifactContent, Sidecar};

/// Decides what a stage schedules.
pub trait StageStrategy: Send + Sync {
    /// Groups of input product ids, each the complete input set for one job.
    ///
    /// Must not have side effects: the scheduler may call it again before
    /// committing anything.
    fn find_ready_inputs(
        &self,
        store: &dyn StoreRead,
        config: &StageConfig,
        reference_time: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Vec<ProductId>>>;

    /// Products that can never be used and should be marked `impossible`.
    fn find_impossible_inputs(
        &self,
        _store: &dyn StoreRead,
        _config: &StageConfig,
        _reference_time: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ProductId>> {
        Ok(Vec::new())
    }

    /// Planned output rows for one input group.
    fn make_outputs(
        &self,
        inputs: &[Product],
        config: &StageConfig,
        reference_time: DateTime<Utc>,
    ) -> anyhow::Result<Vec<NewProduct>>;

    /// The job row for one input group, with serialized call parameters and
    /// an initial priority.
    fn make_job(
        &self,
        inputs: &[Product],
        outputs: &[Product],
        config: &StageConfig,
        reference_time: DateTime<Utc>,
    ) -> anyhow::Result<NewJob>;
}

/// What a transformation sees besides its parameters.
#[derive(Debug, Clone, Copy)]
pub struct ParameterContext<'a> {
    pub job_id: JobId,
    pub stage: &'a str,
    pub storage_root: &'a Path,
}

/// The scientific computation of a stage.
pub trait Transformation: Send + Sync {
    /// Post-process deserialized call parameters just before `transform`.
    ///
    /// The default resolves storage-relative paths, see
    /// [`params::resolve_storage_paths`].
    fn prepare_parameters(
        &self,
        parameters: Value,
        context: &ParameterContext<'_>,
    ) -> anyhow::Result<Value> {
        Ok(params::resolve_storage_paths(parameters, context.storage_root))
    }

    fn transform(&self, parameters: Value) -> anyhow::Result<Vec<Artifact>>;
}

/// A registered stage.
#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub strategy: Arc<dyn StageStrategy>,
    pub transformation: Arc<dyn Transformation>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// All stages known to this process.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, Stage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a stage.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        strategy: Arc<dyn StageStrategy>,
        transformation: Arc<dyn Transformation>,
    ) -> &mut Self {
        let name = name.into();
        self.stages.insert(
            name.clone(),
            Stage {
                name,
                strategy,
                transformation,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
