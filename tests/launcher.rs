// tests/launcher.rs

mod common;
use crate::common::builders::{ConfigFileBuilder, JobBuilder, StageConfigBuilder, epoch};
use crate::common::{FakeExecutor, init_tracing, job};

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use reductor::config::{ConfigFile, LauncherConfig};
use reductor::executor::RunStatus;
use reductor::launcher::Launcher;
use reductor::model::JobState;
use reductor::store::MemoryStore;

fn config(launcher: LauncherConfig) -> Arc<ConfigFile> {
    Arc::new(
        ConfigFileBuilder::new()
            .with_launcher(launcher)
            .with_stage("l1", StageConfigBuilder::new().escalate(3_600, 50).build())
            .build(),
    )
}

fn setup(
    launcher: LauncherConfig,
) -> (Arc<MemoryStore>, Arc<FakeExecutor>, Launcher<FakeExecutor>) {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(FakeExecutor::with_stages(&["l1"]));
    let launcher = Launcher::new(store.clone(), executor.clone(), config(launcher));
    (store, executor, launcher)
}

#[tokio::test]
async fn live_work_is_preferred_over_backfill() {
    init_tracing();
    let (store, executor, launcher) = setup(LauncherConfig {
        max_running: 1,
        ..LauncherConfig::default()
    });

    let low = JobBuilder::new("l1").priority(5).insert(&*store);
    let high = JobBuilder::new("l1").priority(100).insert(&*store);
    let backfill = JobBuilder::new("l1").priority(100).backfill(true).insert(&*store);

    let report = launcher.run_cycle(epoch()).await.unwrap();

    assert_eq!(report.admitted, vec![high]);
    assert_eq!(executor.launched_jobs(), vec![high]);
    assert_eq!(job(&store, high).state, JobState::Launched);
    assert_eq!(job(&store, low).state, JobState::Planned);
    assert_eq!(job(&store, backfill).state, JobState::Planned);
}

#[tokio::test]
async fn running_jobs_consume_capacity() {
    init_tracing();
    let (store, executor, launcher) = setup(LauncherConfig {
        max_running: 3,
        ..LauncherConfig::default()
    });

    JobBuilder::new("l1").state(JobState::Running).insert(&*store);
    JobBuilder::new("l1").state(JobState::Launched).insert(&*store);
    for _ in 0..5 {
        JobBuilder::new("l1").insert(&*store);
    }

    let report = launcher.run_cycle(epoch()).await.unwrap();

    assert_eq!(report.admitted.len(), 1);
    assert_eq!(executor.launched_jobs().len(), 1);

    let again = launcher.run_cycle(epoch()).await.unwrap();
    assert!(again.admitted.is_empty());
}

#[tokio::test]
async fn launched_jobs_that_have_not_started_still_fill_the_ceiling() {
    init_tracing();
    let (store, executor, launcher) = setup(LauncherConfig {
        max_running: 2,
        ..LauncherConfig::default()
    });

    for _ in 0..2 {
        JobBuilder::new("l1")
            .state(JobState::Launched)
            .launched_at(epoch())
            .insert(&*store);
    }
    let waiting = JobBuilder::new("l1").insert(&*store);

    let report = launcher.run_cycle(epoch()).await.unwrap();

    assert!(report.admitted.is_empty());
    assert!(executor.launched_jobs().is_empty());
    assert_eq!(job(&store, waiting).state, JobState::Planned);
}

#[tokio::test]
async fn unconfirmed_launches_go_back_to_planned() {
    init_tracing();
    let (store, executor, launcher) = setup(LauncherConfig::default());

    let refused = JobBuilder::new("l1").insert(&*store);
    let accepted = JobBuilder::new("l1").insert(&*store);
    executor.reject_job(refused);

    let report = launcher.run_cycle(epoch()).await.unwrap();

    assert_eq!(report.confirmed, vec![accepted]);
    assert_eq!(report.reverted, vec![refused]);

    let reverted = job(&store, refused);
    assert_eq!(reverted.state, JobState::Planned);
    assert_eq!(reverted.launch_time, None);
    assert_eq!(reverted.run_id, None);

    let confirmed = job(&store, accepted);
    assert_eq!(confirmed.state, JobState::Launched);
    assert!(confirmed.run_id.is_some());
}

#[tokio::test]
async fn non_scheduled_status_is_not_a_confirmation() {
    init_tracing();
    let (store, executor, launcher) = setup(LauncherConfig::default());
    let id = JobBuilder::new("l1").insert(&*store);
    executor.reply_with(RunStatus::Pending);

    let report = launcher.run_cycle(epoch()).await.unwrap();

    assert_eq!(report.reverted, vec![id]);
    assert_eq!(job(&store, id).state, JobState::Planned);
}

#[tokio::test]
async fn missing_deployment_reverts_without_a_request() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(FakeExecutor::with_stages(&["l0"]));
    let launcher = Launcher::new(store.clone(), executor.clone(), config(LauncherConfig::default()));
    let id = JobBuilder::new("l1").insert(&*store);

    let report = launcher.run_cycle(epoch()).await.unwrap();

    assert!(executor.launched_jobs().is_empty());
    assert_eq!(report.reverted, vec![id]);
    assert_eq!(job(&store, id).state, JobState::Planned);
}

#[tokio::test]
async fn waiting_jobs_are_escalated() {
    init_tracing();
    let (store, _executor, launcher) = setup(LauncherConfig {
        max_running: 0,
        ..LauncherConfig::default()
    });
    let old = JobBuilder::new("l1").priority(10).insert(&*store);
    let fresh = JobBuilder::new("l1")
        .priority(10)
        .created_at(epoch() + ChronoDuration::hours(2))
        .insert(&*store);

    let report = launcher
        .run_cycle(epoch() + ChronoDuration::hours(2))
        .await
        .unwrap();

    assert_eq!(report.escalated, vec![old]);
    assert_eq!(job(&store, old).priority, 50);
    assert_eq!(job(&store, fresh).priority, 10);
    assert!(report.admitted.is_empty());
}

#[tokio::test(start_paused = true)]
async fn releases_are_paced_in_batches() {
    init_tracing();
    let (store, executor, launcher) = setup(LauncherConfig {
        max_running: 100,
        max_launch_per_cycle: 100,
        interval_seconds: 60,
        release_deadline_seconds: 50,
        safety_margin_seconds: 5,
        slice_seconds: 5,
        min_batch_size: 5,
    });
    for _ in 0..12 {
        JobBuilder::new("l1").insert(&*store);
    }

    // epoch() sits on an interval boundary: 45 s left, 9 slices, batches of 5.
    let report = launcher.run_cycle(epoch()).await.unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.confirmed.len(), 12);

    let at = executor.launch_instants();
    assert_eq!(at.len(), 12);
    assert_eq!(at[4], at[0]);
    assert!(at[5] - at[0] >= Duration::from_secs(5));
    assert!(at[10] - at[5] >= Duration::from_secs(5));
    assert_eq!(at[11], at[10]);
}
