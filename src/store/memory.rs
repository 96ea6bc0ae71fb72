// src/store/memory.rs

//! In-process store.
//!
//! A [`MemoryTransaction`] holds the store lock for its whole lifetime and
//! works on a private copy of the tables; `commit` publishes the copy. This
//! makes transactions serializable and all-or-nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use tracing::trace;

use super::{JobFilter, ProductFilter, Store, StoreRead, Transaction};
use crate::errors::{ReductorError, Result};
use crate::model::{
    Job, JobId, NewJob, NewProduct, Product, ProductId, ProductKey, Relationship, RelationshipId,
};

#[derive(Debug, Clone)]
struct Tables {
    products: BTreeMap<ProductId, Product>,
    keys: HashMap<ProductKey, ProductId>,
    jobs: BTreeMap<JobId, Job>,
    relationships: BTreeMap<RelationshipId, Relationship>,
    next_product_id: ProductId,
    next_job_id: JobId,
    next_relationship_id: RelationshipId,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            products: BTreeMap::new(),
            keys: HashMap::new(),
            jobs: BTreeMap::new(),
            relationships: BTreeMap::new(),
            next_product_id: 1,
            next_job_id: 1,
            next_relationship_id: 1,
        }
    }
}

/// Store backed by in-memory tables.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| ReductorError::Other(anyhow!("memory store lock poisoned")))
    }

    /// Snapshot of every product, ordered by id.
    pub fn products(&self) -> Result<Vec<Product>> {
        Ok(self.lock()?.products.values().cloned().collect())
    }

    /// Snapshot of every job, ordered by id.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }

    /// Snapshot of every relationship, ordered by id.
    pub fn relationships(&self) -> Result<Vec<Relationship>> {
        Ok(self.lock()?.relationships.values().copied().collect())
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        let guard = self.lock()?;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTransaction<'a> {
    guard: MutexGuard<'a, Tables>,
    working: Tables,
}

impl StoreRead for MemoryTransaction<'_> {
    fn product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.working.products.get(&id).cloned())
    }

    fn find_products(&self, filter: &ProductFilter) -> Result<Vec<Product>> {
        Ok(self
            .working
            .products
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    fn products_for_job(&self, job_id: JobId) -> Result<Vec<Product>> {
        Ok(self
            .working
            .products
            .values()
            .filter(|p| p.producing_job_id == Some(job_id))
            .cloned()
            .collect())
    }

    fn job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.working.jobs.get(&id).cloned())
    }

    fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self
            .working
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<usize> {
        Ok(self.working.jobs.values().filter(|j| filter.matches(j)).count())
    }

    fn relationships_for_child(&self, child: ProductId) -> Result<Vec<Relationship>> {
        Ok(self
            .working
            .relationships
            .values()
            .filter(|r| r.child_id == child)
            .copied()
            .collect())
    }

    fn relationships_for_parent(&self, parent: ProductId) -> Result<Vec<Relationship>> {
        Ok(self
            .working
            .relationships
            .values()
            .filter(|r| r.parent_id == parent)
            .copied()
            .collect())
    }
}

impl MemoryTransaction<'_> {
    fn check_job_reference(&self, job_id: Option<JobId>) -> Result<()> {
        match job_id {
            Some(id) if !self.working.jobs.contains_key(&id) => Err(ReductorError::Constraint(
                format!("producing job {id} does not exist"),
            )),
            _ => Ok(()),
        }
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn as_read(&self) -> &dyn StoreRead {
        self
    }

    fn insert_product(&mut self, product: NewProduct) -> Result<ProductId> {
        if let Some(existing) = self.working.keys.get(&product.key) {
            return Err(ReductorError::Constraint(format!(
                "product {:?} already exists as id {existing}",
                product.key
            )));
        }
        self.check_job_reference(product.producing_job_id)?;

        let id = match product.id {
            Some(id) if self.working.products.contains_key(&id) => {
                return Err(ReductorError::Constraint(format!(
                    "product id {id} already in use"
                )));
            }
            Some(id) => id,
            None => self.working.next_product_id,
        };
        self.working.next_product_id = self.working.next_product_id.max(id + 1);

        self.working.keys.insert(product.key.clone(), id);
        self.working.products.insert(id, product.into_product(id));
        trace!(product_id = id, "inserted product");
        Ok(id)
    }

    fn update_product(&mut self, product: &Product) -> Result<()> {
        self.check_job_reference(product.producing_job_id)?;

        let old_key = match self.working.products.get(&product.id) {
            Some(old) => old.key(),
            None => return Err(ReductorError::ProductNotFound(product.id)),
        };
        let new_key = product.key();
        if new_key != old_key {
            if self.working.keys.contains_key(&new_key) {
                return Err(ReductorError::Constraint(format!(
                    "product {new_key:?} already exists"
                )));
            }
            self.working.keys.remove(&old_key);
            self.working.keys.insert(new_key, product.id);
        }
        self.working.products.insert(product.id, product.clone());
        Ok(())
    }

    fn delete_product(&mut self, id: ProductId) -> Result<()> {
        if self.working.relationships.values().any(|r| r.touches(id)) {
            return Err(ReductorError::Constraint(format!(
                "product {id} is still referenced by relationships"
            )));
        }
        let removed = self
            .working
            .products
            .remove(&id)
            .ok_or(ReductorError::ProductNotFound(id))?;
        self.working.keys.remove(&removed.key());
        Ok(())
    }

    fn insert_job(&mut self, job: NewJob) -> Result<JobId> {
        let id = self.working.next_job_id;
        self.working.next_job_id += 1;
        self.working.jobs.insert(id, job.into_job(id));
        trace!(job_id = id, "inserted job");
        Ok(id)
    }

    fn update_job(&mut self, job: &Job) -> Result<()> {
        match self.working.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(ReductorError::JobNotFound(job.id)),
        }
    }

    fn delete_job(&mut self, id: JobId) -> Result<()> {
        if self
            .working
            .products
            .values()
            .any(|p| p.producing_job_id == Some(id))
        {
            return Err(ReductorError::Constraint(format!(
                "job {id} is still referenced by products"
            )));
        }
        self.working
            .jobs
            .remove(&id)
            .map(|_| ())
            .ok_or(ReductorError::JobNotFound(id))
    }

    fn insert_relationship(
        &mut self,
        parent: ProductId,
        child: ProductId,
    ) -> Result<RelationshipId> {
        for endpoint in [parent, child] {
            if !self.working.products.contains_key(&endpoint) {
                return Err(ReductorError::Constraint(format!(
                    "relationship endpoint {endpoint} does not exist"
                )));
            }
        }
        let id = self.working.next_relationship_id;
        self.working.next_relationship_id += 1;
        self.working.relationships.insert(
            id,
            Relationship {
                id,
                parent_id: parent,
                child_id: child,
            },
        );
        Ok(id)
    }

    fn delete_relationships_touching(&mut self, product: ProductId) -> Result<usize> {
        let before = self.working.relationships.len();
        self.working.relationships.retain(|_, r| !r.touches(product));
        Ok(before - self.working.relationships.len())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobState, ProductState};
    use chrono::{TimeZone, Utc};

    fn key(source: &str) -> ProductKey {
        ProductKey {
            stage: "l1".into(),
            product_type: "img".into(),
            source: source.into(),
            version: 1,
            observation_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn planned(source: &str) -> NewProduct {
        NewProduct::planned(key(source), Utc::now())
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.insert_product(planned("a")).unwrap();
        }
        assert!(store.products().unwrap().is_empty());

        let mut tx = store.begin().unwrap();
        tx.insert_product(planned("a")).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.products().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_key_is_a_constraint_violation() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.insert_product(planned("a")).unwrap();
        let err = tx.insert_product(planned("a")).unwrap_err();
        assert!(matches!(err, ReductorError::Constraint(_)));
    }

    #[test]
    fn explicit_ids_advance_the_sequence() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.insert_product(planned("a").with_id(10)).unwrap(), 10);
        assert_eq!(tx.insert_product(planned("b").with_id(11)).unwrap(), 11);
        assert_eq!(tx.insert_product(planned("c")).unwrap(), 12);
    }

    #[test]
    fn dangling_job_reference_is_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let mut product = planned("a");
        product.producing_job_id = Some(99);
        assert!(matches!(
            tx.insert_product(product),
            Err(ReductorError::Constraint(_))
        ));
    }

    #[test]
    fn delete_order_is_enforced() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let job = tx
            .insert_job(NewJob::new("l1", "img", &serde_json::json!({}), Utc::now()))
            .unwrap();
        let parent = tx.insert_product(planned("a")).unwrap();
        let mut child = planned("b");
        child.producing_job_id = Some(job);
        let child = tx.insert_product(child).unwrap();
        tx.insert_relationship(parent, child).unwrap();

        assert!(tx.delete_job(job).is_err());
        assert!(tx.delete_product(child).is_err());

        assert_eq!(tx.delete_relationships_touching(child).unwrap(), 1);
        tx.delete_product(child).unwrap();
        tx.delete_job(job).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.products().unwrap().len(), 1);
        assert!(store.jobs().unwrap().is_empty());
    }

    #[test]
    fn filters_select_by_state() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.insert_product(planned("a")).unwrap();
        tx.insert_product(planned("b").with_state(ProductState::Created))
            .unwrap();
        tx.insert_job(NewJob::new("l1", "img", &serde_json::json!({}), Utc::now()))
            .unwrap();

        let created = tx
            .find_products(&ProductFilter::stage("l1").state(ProductState::Created))
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].source, "b");

        assert_eq!(
            tx.count_jobs(&JobFilter::in_state(JobState::Planned).stage("l1"))
                .unwrap(),
            1
        );
        assert_eq!(
            tx.count_jobs(&JobFilter::in_state(JobState::Running)).unwrap(),
            0
        );
    }

    #[test]
    fn time_window_and_type_filters() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let early = key("a");
        let mut late = key("b");
        late.observation_time = early.observation_time + chrono::Duration::hours(2);
        tx.insert_product(NewProduct::planned(early.clone(), Utc::now()))
            .unwrap();
        tx.insert_product(NewProduct::planned(late, Utc::now()))
            .unwrap();
        tx.insert_job(NewJob::new("l1", "stack", &serde_json::json!({}), Utc::now()))
            .unwrap();

        let window = ProductFilter::stage("l1").product_type("img").observed_between(
            early.observation_time,
            early.observation_time + chrono::Duration::hours(1),
        );
        let found = tx.find_products(&window).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source, "a");

        assert_eq!(tx.count_jobs(&JobFilter::default().job_type("stack")).unwrap(), 1);
        assert_eq!(tx.count_jobs(&JobFilter::default().job_type("img")).unwrap(), 0);
    }

    #[test]
    fn relationships_are_found_from_both_ends() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let parent = tx.insert_product(planned("a")).unwrap();
        let first = tx.insert_product(planned("b")).unwrap();
        let second = tx.insert_product(planned("c")).unwrap();
        tx.insert_relationship(parent, first).unwrap();
        tx.insert_relationship(parent, second).unwrap();

        let children: Vec<_> = tx
            .relationships_for_parent(parent)
            .unwrap()
            .iter()
            .map(|r| r.child_id)
            .collect();
        assert_eq!(children, vec![first, second]);
        assert_eq!(tx.relationships_for_child(second).unwrap()[0].parent_id, parent);
        assert!(tx.insert_relationship(parent, 999).is_err());
    }
}
