//! Single-configuration builds end to end

mod common;

use common::{Harness, StubScheduler, bumped, record, revision, user};
use convenient_coordinator::{
    BuildCoordinationStatus, BuildOptions, BuildRecordId, BuildResult, BuildStatus, BuildTask,
    BuildTaskId, ConfigId, CoordinationError, CoordinatorConfig, Datastore, GraphRejection,
    RetryPolicy, StatusChangedEvent,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn configs<'a>(tasks: impl Iterator<Item = &'a BuildTask>) -> BTreeSet<u32> {
    tasks.map(|t| t.config_id().0).collect()
}

#[tokio::test]
async fn test_changed_root_with_up_to_date_dependency() {
    // X -> Y, Y built, X has a new revision
    let y = revision(2, &[]);
    let x = revision(1, &[2]);
    let x2 = bumped(&x, "feature");
    let mut h = Harness::local(
        &[y.clone(), x.clone(), x2.clone()],
        vec![record("RY", &y, &[], 60), record("RX", &x, &[(2, "RY")], 30)],
    )
    .await;

    let plan = h
        .coordinator
        .plan_config(x2.clone(), BuildOptions::default(), &user())
        .await
        .unwrap();
    assert!(plan.is_accepted());
    assert_eq!(plan.graph.vertex_count(), 1);
    assert_eq!(plan.graph.edge_count(), 0);

    let outcome = h
        .coordinator
        .build_config(x2.clone(), BuildOptions::default(), user())
        .await
        .unwrap();
    assert!(outcome.is_accepted());
    assert_eq!(configs(outcome.submitted()), BTreeSet::from([1]));

    h.settle().await;
    let task = outcome.task_for(ConfigId(1)).unwrap().id.clone();
    assert_eq!(h.status(&task).await, BuildCoordinationStatus::Building);

    let done = h
        .coordinator
        .complete_build(&task, BuildResult::success())
        .await
        .unwrap();
    assert_eq!(done.status, BuildCoordinationStatus::Done);
    assert!(done.start_time.is_some() && done.end_time.is_some());

    let saved = h.store.record(&task).await.unwrap().unwrap();
    assert_eq!(saved.status, BuildStatus::Success);
    assert_eq!(saved.fingerprint, x2.fingerprint());
    assert_eq!(saved.dependency_records[&ConfigId(2)], BuildRecordId::new("RY"));
}

#[tokio::test]
async fn test_chain_builds_in_dependency_order() {
    // X -> Y -> Z, nothing built yet
    let revisions = [revision(1, &[2]), revision(2, &[3]), revision(3, &[])];
    let mut h = Harness::local(&revisions, Vec::new()).await;

    let plan = h
        .coordinator
        .plan_config(revisions[0].clone(), BuildOptions::default(), &user())
        .await
        .unwrap();
    assert_eq!(plan.graph.vertex_count(), 3);
    let edges: BTreeSet<(u32, u32)> = plan
        .graph
        .edges()
        .iter()
        .map(|e| {
            let config = |id: &BuildTaskId| plan.graph.vertex(id).unwrap().config_id().0;
            (config(&e.from), config(&e.to))
        })
        .collect();
    assert_eq!(edges, BTreeSet::from([(1, 2), (2, 3)]));
    assert!(plan.graph.find_cycle().is_none());

    let outcome = h
        .coordinator
        .build_config(revisions[0].clone(), BuildOptions::default(), user())
        .await
        .unwrap();
    assert_eq!(outcome.submitted().count(), 3);
    let id = |config| outcome.task_for(ConfigId(config)).unwrap().id.clone();
    let (x, y, z) = (id(1), id(2), id(3));

    h.settle().await;
    assert_eq!(h.status(&z).await, BuildCoordinationStatus::Building);
    assert_eq!(h.status(&y).await, BuildCoordinationStatus::WaitingForDependencies);
    assert_eq!(h.status(&x).await, BuildCoordinationStatus::WaitingForDependencies);

    let _ = h.coordinator.complete_build(&z, BuildResult::success()).await.unwrap();
    h.settle().await;
    assert_eq!(h.status(&y).await, BuildCoordinationStatus::Building);
    assert_eq!(h.status(&x).await, BuildCoordinationStatus::WaitingForDependencies);

    let _ = h.coordinator.complete_build(&y, BuildResult::success()).await.unwrap();
    h.settle().await;
    assert_eq!(h.status(&x).await, BuildCoordinationStatus::Building);

    let failed = h
        .coordinator
        .complete_build(&x, BuildResult::build_failed("tests failed"))
        .await
        .unwrap();
    assert_eq!(failed.status, BuildCoordinationStatus::DoneWithErrors);
    h.settle().await;
    assert_eq!(h.status(&x).await, BuildCoordinationStatus::DoneWithErrors);

    let x_record = h.store.record(&x).await.unwrap().unwrap();
    assert_eq!(x_record.status, BuildStatus::Failed);
    assert_eq!(x_record.dependency_records[&ConfigId(2)], y);
}

#[tokio::test]
async fn test_running_dependency_with_pending_rebuild_conflicts() {
    // X -> Y -> Z; Y is already building on its own, Z was never built
    let revisions = [revision(1, &[2]), revision(2, &[3]), revision(3, &[])];
    let mut h = Harness::local(&revisions, Vec::new()).await;

    let first = h
        .coordinator
        .build_config(
            revisions[1].clone(),
            BuildOptions::default().without_dependencies(),
            user(),
        )
        .await
        .unwrap();
    assert_eq!(configs(first.submitted()), BTreeSet::from([2]));
    h.settle().await;

    let error = h
        .coordinator
        .build_config(revisions[0].clone(), BuildOptions::default(), user())
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinationError::BuildConflict(_)));
    assert_eq!(h.store.tasks().await.len(), 1);
}

#[tokio::test]
async fn test_running_dependency_is_reused() {
    // X -> Y, Y building, X new: X waits for the running task
    let revisions = [revision(1, &[2]), revision(2, &[])];
    let mut h = Harness::local(&revisions, Vec::new()).await;

    let first = h
        .coordinator
        .build_config(revisions[1].clone(), BuildOptions::default(), user())
        .await
        .unwrap();
    let y = first.task_for(ConfigId(2)).unwrap().id.clone();
    h.settle().await;

    let second = h
        .coordinator
        .build_config(revisions[0].clone(), BuildOptions::default(), user())
        .await
        .unwrap();
    assert!(second.is_accepted());
    assert!(second.task_for(ConfigId(2)).unwrap().already_running);
    assert_eq!(configs(second.submitted()), BTreeSet::from([1]));
    let x = second.task_for(ConfigId(1)).unwrap().id.clone();

    h.settle().await;
    assert_eq!(h.status(&x).await, BuildCoordinationStatus::WaitingForDependencies);

    let _ = h.coordinator.complete_build(&y, BuildResult::success()).await.unwrap();
    h.settle().await;
    assert_eq!(h.status(&x).await, BuildCoordinationStatus::Building);
}

#[tokio::test]
async fn test_everything_up_to_date_is_not_submitted() {
    let y = revision(2, &[]);
    let x = revision(1, &[2]);
    let scheduler = Arc::new(StubScheduler::default());
    let mut h = Harness::stub(
        &[x.clone(), y.clone()],
        vec![record("RY", &y, &[], 60), record("RX", &x, &[(2, "RY")], 30)],
        scheduler.clone(),
        CoordinatorConfig::default(),
    )
    .await;

    let outcome = h
        .coordinator
        .build_config(x.clone(), BuildOptions::default(), user())
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(outcome.rejection, Some(GraphRejection::NoRebuildRequired));
    assert_eq!(outcome.submitted().count(), 0);
    assert!(scheduler.submissions.lock().unwrap().is_empty());

    let task = &outcome.tasks[0];
    assert_eq!(task.status, BuildCoordinationStatus::RejectedAlreadyBuilt);
    assert_eq!(task.no_rebuild_cause, Some(BuildRecordId::new("RX")));
    let saved = h.store.record(&task.id).await.unwrap().unwrap();
    assert_eq!(saved.status, BuildStatus::NoRebuildRequired);

    // Forcing rebuilds the whole tree
    let forced = h
        .coordinator
        .build_config(x, BuildOptions::default().forced(), user())
        .await
        .unwrap();
    h.settle().await;
    assert!(forced.is_accepted());
    assert_eq!(configs(forced.submitted()), BTreeSet::from([1, 2]));
    assert_eq!(scheduler.submitted_tasks().len(), 2);
}

#[tokio::test]
async fn test_rebuilt_configuration_is_then_up_to_date() {
    let x = revision(1, &[]);
    let mut h = Harness::local(&[x.clone()], Vec::new()).await;

    let first = h
        .coordinator
        .build_config(x.clone(), BuildOptions::default(), user())
        .await
        .unwrap();
    let task = first.tasks[0].id.clone();
    h.settle().await;
    let _ = h.coordinator.complete_build(&task, BuildResult::success()).await.unwrap();
    h.settle().await;

    let second = h
        .coordinator
        .build_config(x, BuildOptions::default(), user())
        .await
        .unwrap();
    assert_eq!(second.rejection, Some(GraphRejection::NoRebuildRequired));
    assert_eq!(second.tasks[0].no_rebuild_cause, Some(task));
}

#[tokio::test]
async fn test_scheduling_error_marks_tasks_failed() {
    let x = revision(1, &[]);
    let scheduler = Arc::new(StubScheduler::unavailable());
    let mut h = Harness::stub(&[x.clone()], Vec::new(), scheduler, CoordinatorConfig::default()).await;

    let outcome = h
        .coordinator
        .build_config(x, BuildOptions::default(), user())
        .await
        .unwrap();
    assert!(outcome.is_accepted());
    h.settle().await;

    let task = h.task(&outcome.tasks[0].id).await;
    assert_eq!(task.status, BuildCoordinationStatus::SystemError);
    assert!(task.status_description.unwrap().contains("engine unavailable"));
    let saved = h.store.record(&task.id).await.unwrap().unwrap();
    assert_eq!(saved.status, BuildStatus::SystemError);
}

#[tokio::test(start_paused = true)]
async fn test_scheduling_conflict_is_retried() {
    let x = revision(1, &[]);
    let scheduler = Arc::new(StubScheduler::conflicting(2));
    let config = CoordinatorConfig {
        submit_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            ..RetryPolicy::default()
        },
        ..CoordinatorConfig::default()
    };
    let mut h = Harness::stub(&[x.clone()], Vec::new(), scheduler.clone(), config).await;

    let outcome = h
        .coordinator
        .build_config(x, BuildOptions::default(), user())
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(scheduler.submitted_tasks(), vec![outcome.tasks[0].id.clone()]);
    assert_eq!(
        h.status(&outcome.tasks[0].id).await,
        BuildCoordinationStatus::New
    );
}

#[tokio::test]
async fn test_status_changes_are_notified_once() {
    let x = revision(1, &[]);
    let mut h = Harness::local(&[x.clone()], Vec::new()).await;
    let mut events = h.coordinator.subscribe();

    let outcome = h
        .coordinator
        .build_config(x, BuildOptions::default(), user())
        .await
        .unwrap();
    let task = outcome.tasks[0].id.clone();
    h.settle().await;
    let _ = h.coordinator.complete_build(&task, BuildResult::success()).await.unwrap();
    h.settle().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let StatusChangedEvent::Task { old, new, .. } = event {
            seen.push((old, new));
        }
    }
    assert_eq!(
        seen,
        vec![
            (BuildCoordinationStatus::New, BuildCoordinationStatus::Enqueued),
            (BuildCoordinationStatus::Enqueued, BuildCoordinationStatus::Building),
            (BuildCoordinationStatus::Building, BuildCoordinationStatus::Done),
        ]
    );
}

#[tokio::test]
async fn test_completion_of_finished_task_is_refused() {
    let x = revision(1, &[]);
    let mut h = Harness::local(&[x.clone()], Vec::new()).await;
    let outcome = h
        .coordinator
        .build_config(x, BuildOptions::default(), user())
        .await
        .unwrap();
    let task = outcome.tasks[0].id.clone();
    h.settle().await;
    let _ = h.coordinator.complete_build(&task, BuildResult::success()).await.unwrap();

    let error = h
        .coordinator
        .complete_build(&task, BuildResult::build_failed("late"))
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinationError::InvalidTransition { .. }));
    assert_eq!(h.status(&task).await, BuildCoordinationStatus::Done);
}
