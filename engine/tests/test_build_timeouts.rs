//! Forced stage timeouts of the build flow, on a paused clock

mod common;

use std::time::Duration;

use common::{commit, fast_build_options, flow, success_flow, Harness};

use release_engine::adapters::build_server::FlowStatus;
use release_engine::build::controller::{BuildOptions, BuildOrder};
use release_engine::build::flow::{FlowTimeouts, EXECUTION_TIMEOUT, QUEUEING_TIMEOUT};
use release_engine::cache::progress::{done_key, snapshot_key};
use release_engine::models::app::AppModule;
use release_engine::models::build::BuildStatus;
use release_engine::models::deploy::DeployMode;
use release_engine::models::result::JobKind;
use release_engine::models::stage::StageStatus;

fn options() -> BuildOptions {
    BuildOptions {
        flow: FlowTimeouts {
            interval: Duration::from_secs(5),
            queueing: Duration::from_secs(60),
            execution: Duration::from_secs(300),
        },
        ..fast_build_options()
    }
}

fn harness() -> Harness {
    Harness::with_options(vec![AppModule::new("web", DeployMode::Kubernetes)], &[], options())
}

#[tokio::test(start_paused = true)]
async fn test_run_stuck_in_queue_times_out() {
    let h = harness();
    h.build_server.set_flows(vec![flow(FlowStatus::NotExecuted, &[])]);

    let id = h.builds.request_build(BuildOrder::new("web", commit("abc123"))).await.unwrap();
    let started = tokio::time::Instant::now();
    h.builds.follow(id).await;

    let job = h.builds.get(&id).await.unwrap();
    assert_eq!(job.status, BuildStatus::TimedOut);
    assert_eq!(job.message.as_deref(), Some(QUEUEING_TIMEOUT));
    assert!(started.elapsed() > Duration::from_secs(60));
    assert!(started.elapsed() < Duration::from_secs(300));

    let result = h.stores.results.get(&id).await.unwrap().unwrap();
    assert_eq!(result.status_name, "timed_out");
}

#[tokio::test(start_paused = true)]
async fn test_long_running_build_times_out() {
    let h = harness();
    h.build_server.set_flows(vec![
        flow(FlowStatus::NotExecuted, &[]),
        flow(
            FlowStatus::InProgress,
            &[("checkout", FlowStatus::Success), ("build", FlowStatus::InProgress)],
        ),
    ]);

    let id = h.builds.request_build(BuildOrder::new("web", commit("abc123"))).await.unwrap();
    let started = tokio::time::Instant::now();
    h.builds.follow(id).await;

    let job = h.builds.get(&id).await.unwrap();
    assert_eq!(job.status, BuildStatus::TimedOut);
    assert_eq!(job.message.as_deref(), Some(EXECUTION_TIMEOUT));
    assert!(started.elapsed() > Duration::from_secs(300));

    // the stage still running when the threshold hit is recorded as timed out
    let result = h.stores.results.get(&id).await.unwrap().unwrap();
    let stages = &result.per_target_stages[0].stages;
    assert_eq!(stages.len(), 2);
    assert_eq!(stages[0].status, StageStatus::Success);
    assert_eq!(stages[1].status, StageStatus::TimedOut);

    // progress of the job stays readable until the cleanup task runs
    let progress = &h.stores.progress;
    assert!(progress.get(&snapshot_key(JobKind::Build, &id)).await.unwrap().is_some());
    assert!(progress.get(&done_key(JobKind::Build, &id)).await.unwrap().is_some());
}

/// Queue drained, progress outliving the cleanup delay
fn draining_harness() -> Harness {
    let options = BuildOptions {
        progress_ttl: Duration::from_secs(3_600),
        timeout_cleanup: Duration::from_secs(120),
        ..options()
    };
    let mut h = Harness::with_options(vec![AppModule::new("web", DeployMode::Kubernetes)], &[], options);
    h.drain_queue();
    h
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_purges_progress_of_timed_out_build() {
    let h = draining_harness();
    h.build_server.set_flows(vec![flow(FlowStatus::NotExecuted, &[])]);

    let id = h.builds.request_build(BuildOrder::new("web", commit("abc123"))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(h.builds.get(&id).await.unwrap().status, BuildStatus::TimedOut);
    let progress = &h.stores.progress;
    assert!(progress.get(&done_key(JobKind::Build, &id)).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(progress.get(&snapshot_key(JobKind::Build, &id)).await.unwrap().is_none());
    assert!(progress.get(&done_key(JobKind::Build, &id)).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_spares_progress_of_retried_build() {
    let h = draining_harness();
    h.build_server.set_flows(vec![flow(FlowStatus::NotExecuted, &[])]);

    let id = h.builds.request_build(BuildOrder::new("web", commit("abc123"))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(h.builds.get(&id).await.unwrap().status, BuildStatus::TimedOut);

    // retried and finished before the first attempt's cleanup is due
    h.build_server.set_flows(vec![success_flow()]);
    h.builds.retry(&id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.builds.get(&id).await.unwrap().status, BuildStatus::Success);

    tokio::time::sleep(Duration::from_secs(150)).await;
    let progress = &h.stores.progress;
    let snapshot = progress.get(&snapshot_key(JobKind::Build, &id)).await.unwrap();
    assert_eq!(snapshot.unwrap()["statusName"], "success");
    assert!(progress.get(&done_key(JobKind::Build, &id)).await.unwrap().is_some());
}
