#![allow(dead_code, unused_imports)]

pub use reductor_test_utils::builders;
pub use reductor_test_utils::fake_executor::FakeExecutor;
pub use reductor_test_utils::stages;
pub use reductor_test_utils::{init_tracing, with_timeout};

use reductor::model::{Job, JobId, Product, ProductId};
use reductor::store::MemoryStore;

pub fn job(store: &MemoryStore, id: JobId) -> Job {
    store
        .jobs()
        .unwrap()
        .into_iter()
        .find(|j| j.id == id)
        .unwrap_or_else(|| panic!("job {id} not found"))
}

pub fn product(store: &MemoryStore, id: ProductId) -> Product {
    store
        .products()
        .unwrap()
        .into_iter()
        .find(|p| p.id == id)
        .unwrap_or_else(|| panic!("product {id} not found"))
}
