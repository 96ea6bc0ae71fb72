// src/store/mod.rs

//! Persistent store abstraction.
//!
//! Every component reads and writes Products, Jobs and Relationships through a
//! [`Transaction`] obtained from a [`Store`]. A transaction is either committed
//! as a whole or, when dropped without [`Transaction::commit`], rolled back.
//!
//! - [`sqlite`] provides [`SqliteStore`], the database the control plane runs
//!   on. Rows outlive the process, so a restart resumes where it stopped.
//! - [`memory`] provides [`MemoryStore`], an in-process implementation with
//!   the same constraints, used by tests.
//!
//! Store access is synchronous by contract: no transaction may be held across
//! an `.await`.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::model::{
    Job, JobId, JobState, NewJob, NewProduct, Product, ProductId, ProductState, Relationship,
    RelationshipId,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Read-only queries available inside any transaction.
pub trait StoreRead {
    fn product(&self, id: ProductId) -> Result<Option<Product>>;
    fn find_products(&self, filter: &ProductFilter) -> Result<Vec<Product>>;
    /// Products whose `producing_job_id` is `job_id`, ordered by id.
    fn products_for_job(&self, job_id: JobId) -> Result<Vec<Product>>;

    fn job(&self, id: JobId) -> Result<Option<Job>>;
    fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;
    fn count_jobs(&self, filter: &JobFilter) -> Result<usize>;

    fn relationships_for_child(&self, child: ProductId) -> Result<Vec<Relationship>>;
    fn relationships_for_parent(&self, parent: ProductId) -> Result<Vec<Relationship>>;
}

/// A unit of work against the store.
pub trait Transaction: StoreRead {
    /// View this transaction through its read-only interface.
    fn as_read(&self) -> &dyn StoreRead;

    /// Insert a product. Fails on a duplicate [`ProductKey`](crate::model::ProductKey)
    /// or a dangling `producing_job_id`.
    fn insert_product(&mut self, product: NewProduct) -> Result<ProductId>;
    fn update_product(&mut self, product: &Product) -> Result<()>;
    /// Fails while relationships still reference the product.
    fn delete_product(&mut self, id: ProductId) -> Result<()>;

    fn insert_job(&mut self, job: NewJob) -> Result<JobId>;
    fn update_job(&mut self, job: &Job) -> Result<()>;
    /// Fails while products still reference the job.
    fn delete_job(&mut self, id: JobId) -> Result<()>;

    fn insert_relationship(&mut self, parent: ProductId, child: ProductId)
    -> Result<RelationshipId>;
    /// Delete every relationship with `product` as parent or child.
    fn delete_relationships_touching(&mut self, product: ProductId) -> Result<usize>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Shared handle to the persistent store.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>>;
}

/// Set the state of every given product inside `tx`.
pub fn set_product_states(
    tx: &mut dyn Transaction,
    products: &mut [Product],
    state: ProductState,
) -> Result<()> {
    for product in products.iter_mut() {
        product.state = state;
        tx.update_product(product)?;
    }
    Ok(())
}

/// Product query. Unset fields match everything; an empty `states` list
/// matches every state.
#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub stage: Option<String>,
    pub product_type: Option<String>,
    pub source: Option<String>,
    pub states: Vec<ProductState>,
    /// Inclusive lower bound on `observation_time`.
    pub observed_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `observation_time`.
    pub observed_before: Option<DateTime<Utc>>,
}

impl ProductFilter {
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::default()
        }
    }

    pub fn product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = Some(product_type.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn state(mut self, state: ProductState) -> Self {
        self.states.push(state);
        self
    }

    pub fn observed_between(mut self, from: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.observed_from = Some(from);
        self.observed_before = Some(before);
        self
    }

    pub fn matches(&self, product: &Product) -> bool {
        self.stage.as_deref().is_none_or(|s| s == product.stage)
            && self
                .product_type
                .as_deref()
                .is_none_or(|t| t == product.product_type)
            && self.source.as_deref().is_none_or(|s| s == product.source)
            && (self.states.is_empty() || self.states.contains(&product.state))
            && self
                .observed_from
                .is_none_or(|from| product.observation_time >= from)
            && self
                .observed_before
                .is_none_or(|before| product.observation_time < before)
    }
}

/// Job query. Unset fields match everything; an empty `states` list matches
/// every state.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub stage: Option<String>,
    pub job_type: Option<String>,
    pub states: Vec<JobState>,
    /// Exclusive upper bound on `creation_time`.
    pub created_before: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `launch_time`; jobs never launched do not match.
    pub launched_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn in_state(state: JobState) -> Self {
        Self {
            states: vec![state],
            ..Self::default()
        }
    }

    pub fn in_states(states: &[JobState]) -> Self {
        Self {
            states: states.to_vec(),
            ..Self::default()
        }
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn launched_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.launched_before = Some(cutoff);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.stage.as_deref().is_none_or(|s| s == job.stage)
            && self.job_type.as_deref().is_none_or(|t| t == job.job_type)
            && (self.states.is_empty() || self.states.contains(&job.state))
            && self
                .created_before
                .is_none_or(|cutoff| job.creation_time < cutoff)
            && self.launched_before.is_none_or(|cutoff| {
                job.launch_time.is_some_and(|launched| launched < cutoff)
            })
    }
}
