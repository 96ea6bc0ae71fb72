// src/model/relationship.rs

use serde::{Deserialize, Serialize};

use super::{ProductId, RelationshipId};

/// Provenance edge: `parent_id` was an input to the job producing `child_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub parent_id: ProductId,
    pub child_id: ProductId,
}

impl Relationship {
    pub fn touches(&self, product: ProductId) -> bool {
        self.parent_id == product || self.child_id == product
    }
}
