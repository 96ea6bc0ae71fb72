// tests/lifecycle_invariants.rs

mod common;
use crate::common::builders::{ConfigFileBuilder, ProductBuilder, StageConfigBuilder, epoch};
use crate::common::stages::{MergeAll, ScriptedTransformation};
use crate::common::FakeExecutor;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;

use reductor::cleaner::Cleaner;
use reductor::config::{CleanerConfig, ConfigFile};
use reductor::fs::mock::MockFileSystem;
use reductor::fs::ArtifactLayout;
use reductor::harness::{Harness, RunIdentity};
use reductor::launcher::Launcher;
use reductor::model::{JobState, ProductKey};
use reductor::scheduler::{ScheduleOptions, Scheduler};
use reductor::stage::Artifact;
use reductor::store::MemoryStore;

#[derive(Debug, Clone, Copy)]
enum Step {
    AddInput,
    Schedule,
    Launch,
    Process { succeed: bool },
    Clean,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::AddInput),
        Just(Step::Schedule),
        Just(Step::Launch),
        any::<bool>().prop_map(|succeed| Step::Process { succeed }),
        Just(Step::Clean),
    ]
}

struct World {
    store: Arc<MemoryStore>,
    config: Arc<ConfigFile>,
    launcher: Launcher<FakeExecutor>,
    cleaner: Cleaner<FakeExecutor>,
    fs: Arc<MockFileSystem>,
    layout: ArtifactLayout,
    inputs: usize,
}

impl World {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(
            ConfigFileBuilder::new()
                .max_launch_per_cycle(4)
                .with_cleaner(CleanerConfig::default())
                .with_stage("l0", StageConfigBuilder::new().build())
                .with_stage(
                    "l1",
                    StageConfigBuilder::new()
                        .upstream("l0")
                        .max_wait_minutes_launched(30)
                        .max_wait_minutes_running(30)
                        .build(),
                )
                .build(),
        );
        let executor = Arc::new(FakeExecutor::with_stages(&["l1"]));
        let fs = Arc::new(MockFileSystem::new());
        let layout = ArtifactLayout::new("/data");
        Self {
            launcher: Launcher::new(store.clone(), executor.clone(), config.clone()),
            cleaner: Cleaner::new(
                store.clone(),
                executor,
                fs.clone(),
                layout.clone(),
                config.clone(),
            ),
            store,
            config,
            fs,
            layout,
            inputs: 0,
        }
    }

    async fn apply(&mut self, step: Step, now: DateTime<Utc>) {
        match step {
            Step::AddInput => {
                self.inputs += 1;
                ProductBuilder::new("l0", &format!("s{}", self.inputs)).insert(&*self.store);
            }
            Step::Schedule => {
                let l1 = self.config.stage("l1").unwrap();
                let strategy = MergeAll::new("l0", "l1");
                Scheduler::new(&*self.store)
                    .schedule("l1", l1, &strategy, ScheduleOptions::from_config(l1), now)
                    .unwrap();
            }
            Step::Launch => {
                self.launcher.run_cycle(now).await.unwrap();
            }
            Step::Process { succeed } => self.process_one(succeed),
            Step::Clean => {
                self.cleaner.run_pass(now).await;
            }
        }
    }

    /// Run the harness for the oldest launched job. A failing run returns an
    /// artifact no product expects.
    fn process_one(&self, succeed: bool) {
        let Some(job) = self
            .store
            .jobs()
            .unwrap()
            .into_iter()
            .find(|j| j.state == JobState::Launched)
        else {
            return;
        };

        let artifacts: Vec<Artifact> = if succeed {
            self.store
                .products()
                .unwrap()
                .into_iter()
                .filter(|p| p.producing_job_id == Some(job.id))
                .map(|p| Artifact::new(p.key(), b"out".to_vec()))
                .collect()
        } else {
            vec![Artifact::new(
                ProductKey {
                    stage: "l1".into(),
                    product_type: "unexpected".into(),
                    source: "x".into(),
                    version: 9,
                    observation_time: epoch(),
                },
                b"?".to_vec(),
            )]
        };

        let identity = RunIdentity {
            name: job.run_name.clone().unwrap_or_default(),
            id: job.run_id.clone().unwrap_or_default(),
        };
        let result = Harness::new(&*self.store, &*self.fs, &self.layout).run(
            job.id,
            &identity,
            &ScriptedTransformation::returning(artifacts),
        );
        assert_eq!(result.is_ok(), succeed, "harness result: {result:?}");
    }

    fn check_invariants(&self) {
        let jobs = self.store.jobs().unwrap();
        let products = self.store.products().unwrap();
        let job_ids: HashSet<_> = jobs.iter().map(|j| j.id).collect();
        let product_ids: HashSet<_> = products.iter().map(|p| p.id).collect();

        for job in &jobs {
            assert_eq!(
                job.end_time.is_some(),
                job.state.is_terminal(),
                "end_time must be set exactly for terminal jobs: {job:?}"
            );
            if matches!(job.state, JobState::Launched | JobState::Running) {
                assert!(job.launch_time.is_some(), "launched job without launch time: {job:?}");
            }
        }
        for product in &products {
            if let Some(job_id) = product.producing_job_id {
                assert!(job_ids.contains(&job_id), "dangling producer: {product:?}");
            }
        }
        for edge in self.store.relationships().unwrap() {
            assert!(product_ids.contains(&edge.parent_id));
            assert!(product_ids.contains(&edge.child_id));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn control_plane_preserves_store_invariants(
        steps in prop::collection::vec((step(), 0i64..90), 1..40)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        rt.block_on(async {
            let mut world = World::new();
            let mut now = epoch();
            for (step, advance_minutes) in steps {
                now += Duration::minutes(advance_minutes);
                world.apply(step, now).await;
                world.check_invariants();
            }
        });
    }
}

#[test]
fn invariants_hold_on_an_empty_store() {
    World::new().check_invariants();
}

