mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use support::{eventually, fast_sync, git, synced_tracker, Remote};
use tally::config::Config;
use tally::event::{codec, EventKind, EventPayload, ItemId};
use tally::storage::Storage;
use tally::sync::{CommitOutcome, PushGate, SyncEngine};
use tally::Tracker;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_keep_pending_files() {
    let mut remote = Remote::new().expect("remote");
    let root = remote.clone_repo().expect("clone");
    let alice = synced_tracker(&root, "alice", fast_sync(60_000)).expect("alice");
    let engine = alice.sync().expect("sync").clone();

    let outcomes: Arc<Mutex<Vec<CommitOutcome>>> = Arc::default();
    let sink = Arc::clone(&outcomes);
    engine.on_commit_complete(move |outcome| {
        sink.lock().expect("outcomes").push(outcome.clone());
    });

    let url = remote.path().to_string_lossy().to_string();
    let gone = root.join("no-such-remote");
    git(&root, &["remote", "set-url", "origin", &gone.to_string_lossy()]).expect("set-url");
    let before = remote.commit_count();

    alice.create_item("stranded", None).expect("create");
    let outcome = engine.flush().await;

    assert!(!outcome.success, "{outcome:?}");
    assert_eq!(outcome.attempts, 4);
    assert!(outcome.sha.is_none());
    let error = outcome.error.as_deref().expect("error");
    assert!(error.contains("Push failed after 4 attempts"), "{error}");
    assert_eq!(outcomes.lock().expect("outcomes").clone(), vec![outcome]);
    assert_eq!(engine.scheduler().pending_files().len(), 1);
    assert_eq!(remote.commit_count(), before);

    // Once the remote is reachable again the local commit goes out.
    git(&root, &["remote", "set-url", "origin", &url]).expect("set-url");
    let retried = engine.flush().await;
    assert!(retried.success, "{retried:?}");
    assert_eq!(retried.attempts, 1);
    assert!(!engine.scheduler().has_pending());
    assert_eq!(remote.commit_count(), before + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_merge_is_aborted_and_counted() {
    let mut remote = Remote::new().expect("remote");
    let alice_root = remote.clone_repo().expect("clone");
    let bob_root = remote.clone_repo().expect("clone");
    let gate_dir = tempfile::tempdir().expect("gate dir");
    let gate = PushGate::new(gate_dir.path(), "conflicting-merge");

    let alice = synced_tracker(&alice_root, "alice", fast_sync(60_000)).expect("alice");

    let bob_storage = Storage::for_repo(bob_root.clone());
    let bob_engine = SyncEngine::new(bob_storage.clone(), fast_sync(60_000))
        .expect("engine")
        .with_push_gate(Some(gate.clone()));
    let mut bob = Tracker::new(bob_storage.clone(), Config::default(), "bob");
    bob.attach_sync(bob_engine);

    // Same event filename, different bodies: the one case that cannot merge.
    let item = ItemId::parse("12345678").expect("id");
    let encoded = codec::encode(&item, EventKind::Entry);
    let ours = EventPayload::new(encoded.at, Some("bob".to_string())).with_text("bob's take");
    let theirs = EventPayload::new(encoded.at, Some("alice".to_string())).with_text("alice's take");
    assert!(bob_storage.write_event(&encoded.filename, &ours).expect("write"));
    assert!(alice
        .storage()
        .write_event(&encoded.filename, &theirs)
        .expect("write"));

    let engine = bob.sync().expect("sync").clone();
    engine.notify_file_created(&encoded.filename);
    gate.block().expect("block");
    let bob_cycle = tokio::spawn(async move { engine.flush().await });

    assert!(
        eventually(Duration::from_secs(20), || gate.has_been_reached()).await,
        "bob never reached the push"
    );
    let outcome = alice.sync().expect("sync").flush().await;
    assert!(outcome.success, "{outcome:?}");

    gate.release().expect("release");
    let outcome = bob_cycle.await.expect("join");
    assert!(!outcome.success, "{outcome:?}");
    assert_eq!(outcome.attempts, 4);
    assert!(outcome.files.contains(&encoded.filename));

    // The merge was rolled back and bob's copy is untouched.
    assert!(!bob_root.join(".git").join("MERGE_HEAD").exists());
    let kept = bob_storage.read_event(&encoded.filename).expect("read");
    assert_eq!(kept.text.as_deref(), Some("bob's take"));
    assert_eq!(
        bob.sync().expect("sync").scheduler().pending_files(),
        vec![encoded.filename.clone()]
    );
}
