// src/model/mod.rs

//! Persistent entities of the control plane.
//!
//! - [`product`] holds data products (existing or planned) and their lifecycle.
//! - [`job`] holds scheduled executions of a stage's transformation.
//! - [`relationship`] holds provenance edges between products.

pub mod job;
pub mod product;
pub mod relationship;

pub use job::{Job, JobState, NewJob};
pub use product::{NewProduct, Product, ProductKey, ProductState, quality};
pub use relationship::Relationship;

/// Row identifier of a [`Product`].
pub type ProductId = i64;

/// Row identifier of a [`Job`].
pub type JobId = i64;

/// Row identifier of a [`Relationship`].
pub type RelationshipId = i64;

/// Canonical stage name type used throughout the control plane.
pub type StageName = String;
