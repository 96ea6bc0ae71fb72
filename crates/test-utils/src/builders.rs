use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use reductor::config::{
    CleanerConfig, ConfigFile, EscalationTier, LauncherConfig, RawConfigFile, StageConfig,
    StorageConfig,
};
use reductor::model::{JobId, JobState, NewJob, NewProduct, ProductId, ProductKey, ProductState};
use reductor::store::Store;

/// Fixed observation time used by default in test products.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                storage: StorageConfig::default(),
                launcher: LauncherConfig::default(),
                cleaner: CleanerConfig::default(),
                stage: BTreeMap::new(),
            },
        }
    }

    pub fn with_stage(mut self, name: &str, stage: StageConfig) -> Self {
        self.config.stage.insert(name.to_string(), stage);
        self
    }

    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage.root = root.into();
        self
    }

    pub fn database(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.database = path.into();
        self
    }

    pub fn max_running(mut self, max_running: usize) -> Self {
        self.config.launcher.max_running = max_running;
        self
    }

    pub fn max_launch_per_cycle(mut self, n: usize) -> Self {
        self.config.launcher.max_launch_per_cycle = n;
        self
    }

    pub fn with_launcher(mut self, launcher: LauncherConfig) -> Self {
        self.config.launcher = launcher;
        self
    }

    pub fn with_cleaner(mut self, cleaner: CleanerConfig) -> Self {
        self.config.cleaner = cleaner;
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `StageConfig`.
pub struct StageConfigBuilder {
    stage: StageConfig,
}

impl StageConfigBuilder {
    pub fn new() -> Self {
        Self {
            stage: StageConfig::default(),
        }
    }

    pub fn upstream(mut self, stage: &str) -> Self {
        self.stage.upstream.push(stage.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.stage.enabled = false;
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.stage.max_in_flight = Some(max);
        self
    }

    pub fn default_priority(mut self, priority: i64) -> Self {
        self.stage.default_priority = priority;
        self
    }

    pub fn mark_inputs_progressed(mut self, val: bool) -> Self {
        self.stage.mark_inputs_progressed = val;
        self
    }

    pub fn children_one_to_one(mut self, val: bool) -> Self {
        self.stage.children_one_to_one = val;
        self
    }

    pub fn preserves_parents(mut self, val: bool) -> Self {
        self.stage.preserves_parents = val;
        self
    }

    pub fn max_wait_minutes_launched(mut self, minutes: i64) -> Self {
        self.stage.max_wait_minutes_launched = minutes;
        self
    }

    pub fn max_wait_minutes_running(mut self, minutes: i64) -> Self {
        self.stage.max_wait_minutes_running = minutes;
        self
    }

    pub fn escalate(mut self, wait_seconds: i64, priority: i64) -> Self {
        self.stage.escalation.push(EscalationTier {
            wait_seconds,
            priority,
        });
        self
    }

    pub fn build(self) -> StageConfig {
        self.stage
    }
}

impl Default for StageConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `NewProduct` rows.
pub struct ProductBuilder {
    product: NewProduct,
}

impl ProductBuilder {
    /// A `created` product of type `img`, version 1, observed at [`epoch`].
    pub fn new(stage: &str, source: &str) -> Self {
        let key = ProductKey {
            stage: stage.to_string(),
            product_type: "img".to_string(),
            source: source.to_string(),
            version: 1,
            observation_time: epoch(),
        };
        Self {
            product: NewProduct::planned(key, epoch()).with_state(ProductState::Created),
        }
    }

    pub fn id(mut self, id: ProductId) -> Self {
        self.product.id = Some(id);
        self
    }

    pub fn state(mut self, state: ProductState) -> Self {
        self.product.state = state;
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.product.key.observation_time = at;
        self
    }

    pub fn produced_by(mut self, job_id: JobId) -> Self {
        self.product.producing_job_id = Some(job_id);
        self
    }

    pub fn key(&self) -> ProductKey {
        self.product.key.clone()
    }

    pub fn build(self) -> NewProduct {
        self.product
    }

    /// Insert into `store` in its own transaction.
    pub fn insert(self, store: &dyn Store) -> ProductId {
        let mut tx = store.begin().expect("begin");
        let id = tx.insert_product(self.product).expect("insert product");
        tx.commit().expect("commit");
        id
    }
}

/// Builder for job rows in an arbitrary state.
pub struct JobBuilder {
    job: NewJob,
    state: JobState,
    launch_time: Option<DateTime<Utc>>,
    run_id: Option<String>,
}

impl JobBuilder {
    pub fn new(stage: &str) -> Self {
        Self {
            job: NewJob::new(stage, "img", &serde_json::json!({}), epoch()),
            state: JobState::Planned,
            launch_time: None,
            run_id: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn backfill(mut self, val: bool) -> Self {
        self.job.is_backfill = val;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.creation_time = at;
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    pub fn launched_at(mut self, at: DateTime<Utc>) -> Self {
        self.launch_time = Some(at);
        self
    }

    pub fn run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    /// Insert into `store` in its own transaction and return the job id.
    pub fn insert(self, store: &dyn Store) -> JobId {
        let mut tx = store.begin().expect("begin");
        let id = tx.insert_job(self.job).expect("insert job");
        let mut job = tx.job(id).expect("read job").expect("job exists");
        job.state = self.state;
        job.launch_time = self.launch_time;
        job.run_id = self.run_id;
        if self.state.is_terminal() {
            job.end_time = Some(epoch());
        }
        tx.update_job(&job).expect("update job");
        tx.commit().expect("commit");
        id
    }
}
