//! Run monitor end to end: fake task service, scripted stream, paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    completed, connected, marker, output, resource_status, scripted_client, FakeApi, Script,
    ScriptedConnector,
};
use runlens_client::{MonitorOptions, PollOptions, RunMonitor, StreamVariant};
use runlens_core::{PhaseStatus, StageSource};
use runlens_types::{
    ApplyStatus, ResourceAction, ResourceChange, ResourceChangesResponse, TaskSnapshot,
    TaskStatus, TaskType,
};

fn options() -> MonitorOptions {
    MonitorOptions {
        workspace_id: "ws-1".to_string(),
        task_id: 42,
        poll: PollOptions {
            interval: Duration::from_secs(3),
            request_timeout: Duration::from_secs(1),
        },
        stall_after: Duration::from_secs(6),
        completion_grace: Duration::from_secs(2),
    }
}

fn running(stage: &str) -> TaskSnapshot {
    TaskSnapshot::new(42, TaskType::PlanAndApply, TaskStatus::Running).with_stage(stage)
}

fn one_resource() -> ResourceChangesResponse {
    ResourceChangesResponse {
        resources: vec![ResourceChange::new(
            5,
            "aws_s3_bucket.logs",
            "aws_s3_bucket",
            ResourceAction::Create,
        )],
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_plan_and_apply_run_to_completion() {
    let mut confirmed = running("applying");
    confirmed.apply_confirmed_by = Some("alice".to_string());
    let api = Arc::new(
        FakeApi::new([
            running("planning"),
            confirmed,
            TaskSnapshot::new(42, TaskType::PlanAndApply, TaskStatus::Applied)
                .with_stage("applied"),
        ])
        .with_resources(one_resource()),
    );
    let connector = ScriptedConnector::new([
        Script::Frames(vec![
            connected(),
            marker("planning", "begin", 1),
            output("Plan: 1 to add, 0 to change, 0 to destroy.", 2),
            marker("planning", "end", 3),
            marker("applying", "begin", 4),
            output("aws_s3_bucket.logs: Creating...", 5),
        ]),
        // Reconnect replays history, then delivers the rest.
        Script::Frames(vec![
            connected(),
            marker("planning", "begin", 1),
            output("aws_s3_bucket.logs: Creating...", 5),
            resource_status("aws_s3_bucket.logs", "completed"),
            output("Apply complete!", 6),
            completed(),
        ]),
    ]);
    let stream = scripted_client(&connector, StreamVariant::Apply);
    let monitor = RunMonitor::spawn(Arc::clone(&api), stream, options());

    let mut views = monitor.subscribe();
    let live = views
        .wait_for(|v| v.timeline.resource_counts.completed == 1)
        .await
        .unwrap()
        .clone();
    assert_eq!(live.timeline.planning.status, PhaseStatus::Completed);
    assert_eq!(
        live.timeline.applying.as_ref().map(|s| s.status),
        Some(PhaseStatus::Running)
    );
    let stage = live.timeline.current_stage.unwrap();
    assert_eq!(stage.name, "applying");
    assert_eq!(stage.source, StageSource::Live);
    assert_eq!(stage.index, Some(14));

    let done = monitor.finished().await;
    assert!(done.finished);
    assert!(done.stream_completed);
    assert_eq!(done.timeline.status, Some(TaskStatus::Applied));
    assert_eq!(done.timeline.planning.label, "Planned");
    assert_eq!(done.timeline.applying.as_ref().unwrap().label, "Applied");
    assert!(done.stream_error.is_none());

    let names: Vec<_> = done.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["planning", "applying"]);
    assert!(done.stages[0].end_time.is_some());
    assert!(done.stages[1].logs.ends_with("Apply complete!"));
    // Replayed lines appear once.
    assert_eq!(done.stages[1].logs.matches("Creating...").count(), 1);

    // Fetched once when running was first seen and once on the final status.
    assert_eq!(api.resource_fetches(), 2);
    assert_eq!(connector.connect_count(), 2);
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_plan_closes_stream_after_grace() {
    let mut failed = TaskSnapshot::new(42, TaskType::PlanAndApply, TaskStatus::Failed)
        .with_stage("planning");
    failed.error_message = Some("exit status 1".to_string());
    let api = Arc::new(FakeApi::new([running("planning"), failed]));
    let connector = ScriptedConnector::new([Script::FramesThenHold(vec![
        connected(),
        marker("planning", "begin", 1),
        output("Error: invalid provider configuration", 2),
    ])]);
    let stream = scripted_client(&connector, StreamVariant::Apply);
    let monitor = RunMonitor::spawn(api, stream, options());

    let started = tokio::time::Instant::now();
    let done = monitor.finished().await;

    // Failure seen at t=3s, then the 2s grace for a completion event.
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(!done.stream_completed);
    assert!(done.stream_error.is_none());
    assert_eq!(done.timeline.planning.status, PhaseStatus::Error);
    assert_eq!(done.timeline.planning.label, "Plan failed");
    assert!(done.timeline.applying.is_none());
    assert_eq!(done.stages.len(), 1);
    assert!(done.stages[0].end_time.is_none());
    assert_eq!(connector.connect_count(), 1);
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stall_reported_when_stages_disagree() {
    let api = Arc::new(FakeApi::new([running("planning")]));
    let connector = ScriptedConnector::new([Script::FramesThenHold(vec![
        connected(),
        marker("planning", "begin", 1),
        marker("planning", "end", 2),
        marker("policy_check", "begin", 3),
    ])]);
    let stream = scripted_client(&connector, StreamVariant::Apply);
    let monitor = RunMonitor::spawn(api, stream, options());

    let mut views = monitor.subscribe();
    let first = views
        .wait_for(|v| v.timeline.current_stage.is_some() && v.timeline.status.is_some())
        .await
        .unwrap()
        .clone();
    assert!(!first.timeline.stalled);
    // Live stage wins while running.
    assert_eq!(first.timeline.current_stage.unwrap().name, "policy_check");

    let started = tokio::time::Instant::now();
    views.wait_for(|v| v.timeline.stalled).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_restarts_failed_stream() {
    let api = Arc::new(FakeApi::new([running("planning")]));
    let connector = ScriptedConnector::default();
    let stream = scripted_client(&connector, StreamVariant::Apply);
    let monitor = RunMonitor::spawn(api, stream, options());

    let mut views = monitor.subscribe();
    views
        .wait_for(|v| v.stream_error.is_some())
        .await
        .unwrap();
    assert_eq!(connector.connect_count(), 6);
    assert!(!monitor.view().finished);

    monitor.refresh();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.connect_count(), 7);
    assert!(monitor.view().stream_error.is_none());
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_resource_updates_merge_into_view() {
    let api = Arc::new(FakeApi::new([running("applying")]).with_resources(one_resource()));
    let connector = ScriptedConnector::new([
        Script::Frames(vec![connected()]),
        Script::FramesThenHold(vec![
            connected(),
            resource_status("aws_s3_bucket.logs", "applying"),
            resource_status("aws_s3_bucket.unknown", "completed"),
        ]),
    ]);
    let stream = scripted_client(&connector, StreamVariant::Apply);
    let monitor = RunMonitor::spawn(api, stream, options());

    let mut views = monitor.subscribe();
    let view = views
        .wait_for(|v| v.timeline.resource_counts.applying == 1)
        .await
        .unwrap()
        .clone();
    assert_eq!(view.timeline.resource_counts.total(), 1);
    assert_eq!(view.timeline.resources[0].apply_status, ApplyStatus::Applying);
    monitor.stop().await;
}
