mod support;

use std::fs;

use chrono::{Duration, Utc};
use support::TestRepo;
use tally::event::{codec, EventKind, EventPayload, ItemId, PayloadState};
use tally::Tracker;

fn busy_history(tracker: &Tracker) -> Vec<ItemId> {
    let a = tracker.create_item("design", None).expect("a").id;
    let b = tracker.create_item("build", None).expect("b").id;
    let c = tracker.create_item("ship", None).expect("c").id;

    tracker.link_dependency(&c, &b).expect("link");
    tracker.link_dependency(&b, &a).expect("link");
    tracker.set_status(&a, "in_progress").expect("status");
    tracker.add_entry(&a, "sketches done").expect("entry");
    tracker.set_status(&a, "done").expect("status");
    tracker.monitor(&c).expect("monitor");
    tracker.take(&b, None).expect("take");
    tracker.set_tagline(&b, "build it").expect("tagline");
    tracker.unlink_dependency(&c, &b).expect("unlink");
    tracker.set_ignored(&c, true).expect("ignore");
    vec![a, b, c]
}

#[test]
fn incremental_updates_match_a_full_replay() {
    let repo = TestRepo::init().expect("repo");
    let tracker = repo.tracker("alice");
    let items = busy_history(&tracker);

    let report = tracker.integrity_report().expect("report");
    assert!(report.is_clean(), "{:?}", report.problems().collect::<Vec<_>>());

    for item in &items {
        let incremental = tracker.get(item).expect("item");
        let replayed = tracker.rebuild(item).expect("rebuild").expect("exists");
        assert!(incremental.same_state(&replayed), "{item} drifted");
    }
    assert!(tracker.cache().stats().incremental_applies >= 10);
}

#[test]
fn deleting_the_cache_loses_nothing() {
    let repo = TestRepo::init().expect("repo");
    let tracker = repo.tracker("alice");
    let items = busy_history(&tracker);
    let before: Vec<_> = items.iter().map(|id| tracker.get(id).expect("item")).collect();

    fs::remove_dir_all(repo.storage().cache_dir()).expect("remove cache");

    let fresh = repo.tracker("alice");
    for expected in &before {
        let rebuilt = fresh.get(&expected.id).expect("item");
        assert!(rebuilt.same_state(expected), "{} changed", expected.id);
    }
    assert_eq!(fresh.get_all_aggregates().expect("all").len(), 3);
}

#[test]
fn damaged_aggregate_is_rebuilt_on_next_write() {
    let repo = TestRepo::init().expect("repo");
    let tracker = repo.tracker("alice");
    let item = tracker.create_item("fragile", None).expect("create").id;
    tracker.add_entry(&item, "first").expect("entry");

    fs::write(repo.storage().aggregate_file(&item), "{ not json").expect("corrupt");
    let rebuilds = tracker.cache().stats().rebuilds;

    let updated = tracker.add_entry(&item, "second").expect("entry");
    assert_eq!(updated.entries.len(), 2);
    assert!(tracker.cache().stats().rebuilds > rebuilds);
    assert!(tracker.integrity_report().expect("report").is_clean());
}

#[test]
fn late_event_is_folded_in_order() {
    let repo = TestRepo::init().expect("repo");
    let tracker = repo.tracker("alice");
    let item = tracker.create_item("late arrival", None).expect("create").id;
    tracker.set_tagline(&item, "newest tagline").expect("tagline");
    let fallbacks = tracker.cache().stats().fallbacks;

    // An older tagline change shows up after the newer one was applied.
    let earlier = Utc::now() - Duration::hours(1);
    let encoded = codec::encode_at(&item, EventKind::Tagline, earlier);
    let payload = EventPayload::new(encoded.at, Some("bob".to_string())).with_tagline("stale");
    assert!(repo
        .storage()
        .write_event(&encoded.filename, &payload)
        .expect("write"));
    tracker.cache().add_to_index(&encoded.filename).expect("index");
    let state = tracker
        .cache()
        .apply_incremental(&item, &encoded.filename, PayloadState::Known(payload))
        .expect("apply")
        .expect("exists");

    assert_eq!(state.tagline, "newest tagline");
    assert_eq!(tracker.cache().stats().fallbacks, fallbacks + 1);
}

#[test]
fn rejected_writes_leave_no_files() {
    let repo = TestRepo::init().expect("repo");
    let tracker = repo.tracker("alice");
    let a = tracker.create_item("a", None).expect("a").id;
    let b = tracker.create_item("b", None).expect("b").id;
    tracker.link_dependency(&a, &b).expect("link");
    let count = || repo.storage().list_event_files().expect("list").len();
    let before = count();

    let missing = ItemId::parse("98765432").expect("id");
    assert!(tracker.link_dependency(&a, &missing).is_err());
    assert!(tracker.link_dependency(&b, &a).is_err());
    assert!(tracker.set_status(&a, "someday").is_err());
    assert!(tracker.set_tagline(&missing, "ghost").is_err());
    assert!(tracker.add_entry(&a, "   ").is_err());

    assert_eq!(count(), before);
}

#[test]
fn filenames_on_disk_decode_to_their_items() {
    let repo = TestRepo::init().expect("repo");
    let tracker = repo.tracker("alice");
    let items = busy_history(&tracker);

    for filename in repo.storage().list_event_files().expect("list") {
        let name = codec::decode(&filename).expect("decode");
        assert!(items.contains(&name.item), "{filename}");
        assert_eq!(name.encode(), filename);
    }
}
