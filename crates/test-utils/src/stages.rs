//! Minimal stage implementations for end-to-end tests.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

use reductor::config::StageConfig;
use reductor::model::{NewJob, NewProduct, Product, ProductId, ProductKey, ProductState};
use reductor::stage::{Artifact, StageStrategy, Transformation};
use reductor::store::{ProductFilter, StoreRead};

/// Groups every `created` product of `input_stage` into one job with a single
/// output in `output_stage`, keyed after the first input.
pub struct MergeAll {
    pub input_stage: String,
    pub output_stage: String,
}

impl MergeAll {
    pub fn new(input_stage: &str, output_stage: &str) -> Self {
        Self {
            input_stage: input_stage.to_string(),
            output_stage: output_stage.to_string(),
        }
    }
}

impl StageStrategy for MergeAll {
    fn find_ready_inputs(
        &self,
        store: &dyn StoreRead,
        _config: &StageConfig,
        _reference_time: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Vec<ProductId>>> {
        let ready = store.find_products(
            &ProductFilter::stage(self.input_stage.as_str()).state(ProductState::Created),
        )?;
        if ready.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ready.into_iter().map(|p| p.id).collect()])
    }

    fn make_outputs(
        &self,
        inputs: &[Product],
        _config: &StageConfig,
        reference_time: DateTime<Utc>,
    ) -> anyhow::Result<Vec<NewProduct>> {
        let first = &inputs[0];
        let key = ProductKey {
            stage: self.output_stage.clone(),
            product_type: first.product_type.clone(),
            source: first.source.clone(),
            version: 1,
            observation_time: first.observation_time,
        };
        Ok(vec![NewProduct::planned(key, reference_time)])
    }

    fn make_job(
        &self,
        inputs: &[Product],
        outputs: &[Product],
        config: &StageConfig,
        reference_time: DateTime<Utc>,
    ) -> anyhow::Result<NewJob> {
        let params = serde_json::json!({
            "inputs": inputs.iter().map(|p| p.id).collect::<Vec<_>>(),
            "outputs": outputs.iter().map(|p| p.id).collect::<Vec<_>>(),
        });
        Ok(
            NewJob::new(self.output_stage.as_str(), "merge", &params, reference_time)
                .with_priority(config.default_priority),
        )
    }
}

/// Transformation that returns a fixed list of artifacts and records the
/// parameters of every call.
#[derive(Default)]
pub struct ScriptedTransformation {
    artifacts: Vec<Artifact>,
    calls: Mutex<Vec<Value>>,
}

impl ScriptedTransformation {
    pub fn returning(artifacts: Vec<Artifact>) -> Self {
        Self {
            artifacts,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transformation for ScriptedTransformation {
    fn transform(&self, parameters: Value) -> anyhow::Result<Vec<Artifact>> {
        self.calls.lock().unwrap().push(parameters);
        Ok(self.artifacts.clone())
    }
}
