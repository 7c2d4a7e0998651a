// tests/server_tests.rs
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ids, new_log, logged, ScriptedTask};
use taskgrid::{LocalServer, Server, SharedTask, Task, TaskBuilder, TaskPriority};

#[tokio::test]
async fn test_batch_runs_in_priority_then_fifo_order() {
    let server = LocalServer::new("local");
    let log = new_log();

    let submitted = [
        ("low-1", TaskPriority::Low),
        ("high-1", TaskPriority::High),
        ("none-1", TaskPriority::None),
        ("medium-1", TaskPriority::Medium),
        ("high-2", TaskPriority::High),
        ("low-2", TaskPriority::Low),
    ];
    for (id, priority) in submitted {
        let task = ScriptedTask::new(id).priority(priority).logging_to(&log).shared();
        server.add_task(task).await.unwrap();
    }
    assert_eq!(server.queued(), 6);

    let completed = server.execute_tasks().await.unwrap();
    let expected = ["high-1", "high-2", "medium-1", "low-1", "low-2", "none-1"];

    assert_eq!(ids(&completed), expected);
    assert_eq!(logged(&log), expected);
    assert_eq!(server.queued(), 0);
    assert!(server.failed_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_marks_failed_and_cleans_up_once() {
    let server = LocalServer::with_timeout("local", Duration::from_millis(50));
    let slow = Arc::new(
        TaskBuilder::new("slow")
            .work(Duration::from_millis(500))
            .build()
            .unwrap(),
    );
    server.add_task(slow.clone()).await.unwrap();

    let completed = server.execute_tasks().await.unwrap();
    assert!(completed.is_empty());
    assert!(!slow.is_completed());

    let failed = server.failed_tasks().await.unwrap();
    assert_eq!(ids(&failed), ["slow"]);
    assert_eq!(slow.attempts(), 1);
    assert_eq!(slow.cleanups(), 1);

    let stats = server.stats().await.unwrap();
    assert_eq!(stats.tasks_attempted, 1);
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.tasks_completed, 0);
    assert!(stats.total_execution_time >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_failed_task_is_classified_and_list_resets_per_batch() {
    let server = LocalServer::new("local");
    let broken = ScriptedTask::new("broken").failing(1).shared();
    let fine = ScriptedTask::new("fine").shared();

    server.add_task(broken.clone()).await.unwrap();
    server.add_task(fine.clone()).await.unwrap();

    let completed = server.execute_tasks().await.unwrap();
    assert_eq!(ids(&completed), ["fine"]);
    assert_eq!(ids(&server.failed_tasks().await.unwrap()), ["broken"]);
    assert_eq!(broken.cleanups(), 1);
    assert_eq!(fine.cleanups(), 0);

    // second attempt succeeds; the failed list starts empty again
    server.add_task(broken.clone()).await.unwrap();
    let completed = server.execute_tasks().await.unwrap();
    assert_eq!(ids(&completed), ["broken"]);
    assert!(server.failed_tasks().await.unwrap().is_empty());

    let stats = server.stats().await.unwrap();
    assert_eq!(stats.tasks_attempted, 3);
    assert_eq!(stats.tasks_completed, 2);
    assert_eq!(stats.tasks_failed, 1);
}

#[tokio::test]
async fn test_duplicate_is_independent() {
    let original = LocalServer::new("local");
    original
        .add_task(ScriptedTask::new("queued").shared())
        .await
        .unwrap();

    let copy = original.duplicate();
    let completed = copy.execute_tasks().await.unwrap();

    assert_eq!(ids(&completed), ["queued"]);
    assert_eq!(original.queued(), 1);
    assert_eq!(original.stats().await.unwrap().tasks_attempted, 0);
}

#[tokio::test]
async fn test_remove_all_tasks_returns_queue_in_order() {
    let server = LocalServer::new("local");
    for (id, priority) in [("b", TaskPriority::Low), ("a", TaskPriority::High)] {
        let task: SharedTask = ScriptedTask::new(id).priority(priority).shared();
        server.add_task(task).await.unwrap();
    }
    assert_eq!(server.queued_ids(), ["a", "b"]);

    let removed = server.remove_all_tasks().await.unwrap();
    assert_eq!(ids(&removed), ["a", "b"]);
    assert!(server.execute_tasks().await.unwrap().is_empty());
    assert!(server.is_online().await);
}

#[tokio::test]
async fn test_panicking_task_fails_without_wedging_server() {
    let server = LocalServer::new("local");
    let boom = ScriptedTask::new("boom").panicking().shared();
    let bystander = ScriptedTask::new("bystander").shared();
    server.add_task(boom.clone()).await.unwrap();
    server.add_task(bystander.clone()).await.unwrap();

    let completed = server.execute_tasks().await.unwrap();
    assert_eq!(ids(&completed), ["bystander"]);
    assert_eq!(ids(&server.failed_tasks().await.unwrap()), ["boom"]);
    assert_eq!(boom.cleanups(), 1);
    assert_eq!(bystander.attempts(), 1);

    // the monitor closed the panicked attempt, so the next batch runs
    server.add_task(ScriptedTask::new("later").shared()).await.unwrap();
    let completed = server.execute_tasks().await.unwrap();
    assert_eq!(ids(&completed), ["later"]);

    let stats = server.stats().await.unwrap();
    assert_eq!(stats.tasks_attempted, 3);
    assert_eq!(stats.tasks_failed, 1);
}
