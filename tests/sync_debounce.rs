mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use support::{eventually, fast_sync, head_message, synced_tracker, TestRepo};
use tally::sync::CommitOutcome;

#[tokio::test]
async fn burst_of_writes_becomes_one_commit() {
    let repo = TestRepo::init().expect("repo");
    let tracker = synced_tracker(repo.path(), "alice", fast_sync(300)).expect("tracker");
    let engine = tracker.sync().expect("sync").clone();

    let outcomes: Arc<Mutex<Vec<CommitOutcome>>> = Arc::default();
    let sink = Arc::clone(&outcomes);
    engine.on_commit_complete(move |outcome| {
        sink.lock().expect("outcomes").push(outcome.clone());
    });
    engine.start();

    for n in 0..5 {
        tracker.create_item(&format!("item {n}"), None).expect("create");
    }
    assert_eq!(engine.scheduler().pending_files().len(), 5);

    let done = eventually(Duration::from_secs(10), || {
        !outcomes.lock().expect("outcomes").is_empty()
    })
    .await;
    assert!(done, "debounced commit never ran");

    // Give a stray second cycle the chance to show up.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let outcomes = outcomes.lock().expect("outcomes").clone();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success, "{:?}", outcomes[0]);
    assert_eq!(outcomes[0].files.len(), 5);
    assert_eq!(outcomes[0].attempts, 0);

    assert_eq!(repo.commit_count(), 1);
    assert!(head_message(repo.path()).starts_with("tally: record 5 events"));
    assert!(!engine.scheduler().has_pending());
    engine.shutdown();
}

#[tokio::test]
async fn cancelled_window_commits_nothing() {
    let repo = TestRepo::init().expect("repo");
    let tracker = synced_tracker(repo.path(), "alice", fast_sync(200)).expect("tracker");
    let engine = tracker.sync().expect("sync").clone();
    engine.start();

    tracker.create_item("parked", None).expect("create");
    assert!(engine.scheduler().is_scheduled());
    assert!(engine.cancel_pending_commit());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(repo.commit_count(), 0);
    assert!(engine.scheduler().has_pending());

    // A manual flush picks the parked file up.
    let outcome = engine.flush().await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.files.len(), 1);
    assert_eq!(repo.commit_count(), 1);
    assert!(!engine.scheduler().has_pending());
    engine.shutdown();
}

#[tokio::test]
async fn cycle_without_changes_is_a_successful_no_op() {
    let repo = TestRepo::init().expect("repo");
    let tracker = synced_tracker(repo.path(), "alice", fast_sync(60_000)).expect("tracker");
    let engine = tracker.sync().expect("sync");

    tracker.create_item("only item", None).expect("create");
    let first = engine.flush().await;
    assert!(first.success);
    let sha = first.sha.expect("commit");
    assert!(head_message(repo.path()).starts_with("tally: record 1 event"));

    let second = engine.flush().await;
    assert!(second.success);
    assert_eq!(second.sha, None);
    assert!(second.files.is_empty());
    assert_eq!(repo.commit_count(), 1);
    assert_eq!(
        repo.repo().head().expect("head").target().map(|oid| oid.to_string()),
        Some(sha)
    );
}

#[tokio::test]
async fn derived_files_stay_out_of_commits() {
    let repo = TestRepo::init().expect("repo");
    let tracker = synced_tracker(repo.path(), "alice", fast_sync(60_000)).expect("tracker");

    tracker.create_item("cached", None).expect("create");
    let outcome = tracker.sync().expect("sync").flush().await;
    assert!(outcome.success, "{outcome:?}");

    let head = repo.repo().head().expect("head").peel_to_tree().expect("tree");
    let data = head
        .get_path(std::path::Path::new(".tally"))
        .expect("data dir")
        .to_object(repo.repo())
        .expect("object")
        .peel_to_tree()
        .expect("tree");
    let names: Vec<String> = data
        .iter()
        .filter_map(|entry| entry.name().map(str::to_string))
        .collect();
    assert_eq!(names, vec![".gitignore", "events"]);
}
