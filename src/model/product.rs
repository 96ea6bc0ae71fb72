// src/model/product.rs

//! Data products and their lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, ProductId};

/// Bit flags stored in [`Product::quality_flags`].
pub mod quality {
    /// At least one input of the producing job was flagged bad.
    pub const BAD_INPUT: u32 = 1 << 0;
}

/// Lifecycle state of a product.
///
/// - `Planned`: created by a scheduler, not yet produced.
/// - `Creating`: the producing job is running.
/// - `Created`: the artifact exists on disk.
/// - `Unreported`: the transformation chose not to produce it.
/// - `Blank`: produced, but without content.
/// - `Failed`: the producing job failed.
/// - `Progressed`: consumed as an input, not itself reprocessed.
/// - `Impossible`: determined unproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductState {
    Planned,
    Creating,
    Created,
    Unreported,
    Blank,
    Failed,
    Progressed,
    Impossible,
}

impl ProductState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductState::Planned => "planned",
            ProductState::Creating => "creating",
            ProductState::Created => "created",
            ProductState::Unreported => "unreported",
            ProductState::Blank => "blank",
            ProductState::Failed => "failed",
            ProductState::Progressed => "progressed",
            ProductState::Impossible => "impossible",
        }
    }
}

impl fmt::Display for ProductState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "planned" => Ok(ProductState::Planned),
            "creating" => Ok(ProductState::Creating),
            "created" => Ok(ProductState::Created),
            "unreported" => Ok(ProductState::Unreported),
            "blank" => Ok(ProductState::Blank),
            "failed" => Ok(ProductState::Failed),
            "progressed" => Ok(ProductState::Progressed),
            "impossible" => Ok(ProductState::Impossible),
            other => Err(format!("invalid product state: {other}")),
        }
    }
}

/// Natural key of a product. Unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductKey {
    pub stage: String,
    pub product_type: String,
    pub source: String,
    pub version: u32,
    pub observation_time: DateTime<Utc>,
}

/// One data artifact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub stage: String,
    pub product_type: String,
    pub source: String,
    pub version: u32,
    pub state: ProductState,
    pub observation_time: DateTime<Utc>,
    pub creation_time: DateTime<Utc>,
    /// `None` until the scheduler back-fills it after the job insert.
    pub producing_job_id: Option<JobId>,
    pub outlier: bool,
    pub quality_flags: u32,
}

impl Product {
    pub fn key(&self) -> ProductKey {
        ProductKey {
            stage: self.stage.clone(),
            product_type: self.product_type.clone(),
            source: self.source.clone(),
            version: self.version,
            observation_time: self.observation_time,
        }
    }

    pub fn has_bad_input(&self) -> bool {
        self.quality_flags & quality::BAD_INPUT != 0
    }
}

/// A product row that has not been inserted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    /// Explicit id; the store allocates one when `None`.
    pub id: Option<ProductId>,
    pub key: ProductKey,
    pub state: ProductState,
    pub creation_time: DateTime<Utc>,
    pub producing_job_id: Option<JobId>,
    pub outlier: bool,
    pub quality_flags: u32,
}

impl NewProduct {
    /// A `planned` product for the given key, as built by stage strategies.
    pub fn planned(key: ProductKey, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            key,
            state: ProductState::Planned,
            creation_time: now,
            producing_job_id: None,
            outlier: false,
            quality_flags: 0,
        }
    }

    pub fn with_state(mut self, state: ProductState) -> Self {
        self.state = state;
        self
    }

    pub fn with_id(mut self, id: ProductId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn into_product(self, id: ProductId) -> Product {
        Product {
            id,
            stage: self.key.stage,
            product_type: self.key.product_type,
            source: self.key.source,
            version: self.key.version,
            state: self.state,
            observation_time: self.key.observation_time,
            creation_time: self.creation_time,
            producing_job_id: self.producing_job_id,
            outlier: self.outlier,
            quality_flags: self.quality_flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_parse_back() {
        for state in [
            ProductState::Planned,
            ProductState::Creating,
            ProductState::Created,
            ProductState::Unreported,
            ProductState::Blank,
            ProductState::Failed,
            ProductState::Progressed,
            ProductState::Impossible,
        ] {
            assert_eq!(state.to_string().parse::<ProductState>(), Ok(state));
        }
        assert!("archived".parse::<ProductState>().is_err());
    }

    #[test]
    fn bad_input_flag_is_read_from_bits() {
        let key = ProductKey {
            stage: "l1".into(),
            product_type: "img".into(),
            source: "obs".into(),
            version: 1,
            observation_time: Utc::now(),
        };
        let mut product = NewProduct::planned(key, Utc::now()).into_product(1);
        assert!(!product.has_bad_input());
        product.quality_flags |= quality::BAD_INPUT;
        assert!(product.has_bad_input());
    }
}
