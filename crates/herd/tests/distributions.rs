//! Data distributions: shard routing, coverage and versioned publish.

mod common;

use common::{factory, group, store};
use herd::keys::NOTIFYABLE_LOCK;
use herd::{AccessMode, Error, LockMode, Shard, HASH_RANGE_MAX};

#[test]
fn routing_returns_targets_by_priority_then_range() {
    let store = store();
    let (_f, c) = factory(&store);
    let g = group(&c, "app", "g");
    let n0 = g.node("n0", AccessMode::CreateIfMissing).unwrap();
    let n1 = g.node("n1", AccessMode::CreateIfMissing).unwrap();
    let n2 = g.node("n2", AccessMode::CreateIfMissing).unwrap();

    let dist = g.data_distribution("d", AccessMode::CreateIfMissing).unwrap();
    let shards = dist.cached_shards();
    shards.insert(0, 6719722671305337462, Some(n0.as_ref()), 0).unwrap();
    shards
        .insert(6719722671305337462, 6719722671305399999, Some(n1.as_ref()), 0)
        .unwrap();
    shards
        .insert(6719722671305337450, 6719722671305399999, Some(n2.as_ref()), 0)
        .unwrap();

    let hits = shards.get_notifyables(6719722671305337462).unwrap();
    let names: Vec<&str> = hits.iter().map(|nt| nt.name()).collect();
    assert_eq!(names, vec!["n0", "n2", "n1"]);

    // Distinct priorities dominate range order.
    shards
        .insert(6719722671305337461, 6719722671305337463, Some(n1.as_ref()), -5)
        .unwrap();
    let hits = shards.get_notifyables(6719722671305337462).unwrap();
    assert_eq!(hits[0].name(), "n1");
}

#[test]
fn published_shards_round_trip_across_clients() {
    let store = store();
    let (_f0, c0) = factory(&store);
    let g0 = group(&c0, "app", "g");
    let n0 = g0.node("n0", AccessMode::CreateIfMissing).unwrap();
    let dist0 = g0.data_distribution("d", AccessMode::CreateIfMissing).unwrap();

    dist0.acquire_lock(NOTIFYABLE_LOCK, LockMode::Exclusive).unwrap();
    let shards0 = dist0.cached_shards();
    shards0.insert(0, HASH_RANGE_MAX / 2, Some(n0.as_ref()), 1).unwrap();
    shards0.insert(HASH_RANGE_MAX / 2, HASH_RANGE_MAX, None, 2).unwrap();
    shards0.publish().unwrap();
    dist0.release_lock(NOTIFYABLE_LOCK).unwrap();

    // A second client loads the same distribution and sees an identical
    // shard list after canonical re-marshalling.
    let (f1, c1) = factory(&store);
    let g1 = group(&c1, "app", "g");
    let dist1 = g1.data_distribution("d", AccessMode::LoadIfPresent).unwrap();
    f1.synchronize().unwrap();

    assert_eq!(
        dist1.cached_shards().get_all().unwrap(),
        dist0.cached_shards().get_all().unwrap()
    );
    assert_eq!(dist1.cached_shards().count().unwrap(), 2);
    assert!(dist1.cached_shards().version().unwrap() >= 1);
}

#[test]
fn publish_requires_the_exclusive_lock() {
    let store = store();
    let (_f, c) = factory(&store);
    let g = group(&c, "app", "g");
    let dist = g.data_distribution("d", AccessMode::CreateIfMissing).unwrap();

    dist.cached_shards().insert(0, 10, None, 0).unwrap();
    assert!(matches!(
        dist.cached_shards().publish(),
        Err(Error::InvalidMethod(_))
    ));
}

#[test]
fn coverage_over_the_full_range() {
    let store = store();
    let (_f, c) = factory(&store);
    let g = group(&c, "app", "g");
    let dist = g.data_distribution("d", AccessMode::CreateIfMissing).unwrap();
    let shards = dist.cached_shards();

    assert!(!shards.is_covered().unwrap());
    shards.insert(0, HASH_RANGE_MAX, None, 0).unwrap();
    assert!(shards.is_covered().unwrap());

    shards.clear().unwrap();
    let k = HASH_RANGE_MAX / 3;
    shards.insert(0, k, None, 0).unwrap();
    shards.insert(k, HASH_RANGE_MAX, None, 0).unwrap();
    // A shared endpoint still covers.
    assert!(shards.is_covered().unwrap());

    shards.clear().unwrap();
    shards.insert(1, HASH_RANGE_MAX, None, 0).unwrap();
    assert!(!shards.is_covered().unwrap());
}

#[test]
fn filters_are_conjunctive() {
    let store = store();
    let (_f, c) = factory(&store);
    let g = group(&c, "app", "g");
    let n0 = g.node("n0", AccessMode::CreateIfMissing).unwrap();
    let n1 = g.node("n1", AccessMode::CreateIfMissing).unwrap();
    let dist = g.data_distribution("d", AccessMode::CreateIfMissing).unwrap();
    let shards = dist.cached_shards();

    shards.insert(0, 10, Some(n0.as_ref()), 0).unwrap();
    shards.insert(10, 20, Some(n0.as_ref()), 1).unwrap();
    shards.insert(20, 30, Some(n1.as_ref()), 1).unwrap();

    // Both filters must match a shard for it to be returned.
    let hits = shards.get_filtered(Some(n0.as_ref()), Some(1)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].start, 10);

    assert_eq!(shards.get_filtered(Some(n0.as_ref()), None).unwrap().len(), 2);
    assert_eq!(shards.get_filtered(None, Some(1)).unwrap().len(), 2);
    assert_eq!(shards.get_filtered(None, None).unwrap().len(), 3);
}

#[test]
fn remove_and_clear_shards() {
    let store = store();
    let (_f, c) = factory(&store);
    let g = group(&c, "app", "g");
    let n0 = g.node("n0", AccessMode::CreateIfMissing).unwrap();
    let dist = g.data_distribution("d", AccessMode::CreateIfMissing).unwrap();
    let shards = dist.cached_shards();

    shards.insert(5, 15, Some(n0.as_ref()), 7).unwrap();
    let shard = Shard {
        start: 5,
        end: 15,
        target_key: Some(n0.key().to_string()),
        priority: 7,
    };
    assert!(shards.remove(&shard).unwrap());
    assert!(!shards.remove(&shard).unwrap());
    assert_eq!(shards.count().unwrap(), 0);

    shards.insert(0, 1, None, 0).unwrap();
    shards.insert(2, 3, None, 0).unwrap();
    shards.clear().unwrap();
    assert_eq!(shards.count().unwrap(), 0);

    // Inverted ranges never enter the tree.
    assert!(matches!(
        shards.insert(10, 5, None, 0),
        Err(Error::InvalidArguments(_))
    ));
}

#[test]
fn targets_of_removed_objects_are_skipped() {
    let store = store();
    let (_f, c) = factory(&store);
    let g = group(&c, "app", "g");
    let n0 = g.node("doomed", AccessMode::CreateIfMissing).unwrap();
    let dist = g.data_distribution("d", AccessMode::CreateIfMissing).unwrap();
    dist.cached_shards().insert(0, 100, Some(n0.as_ref()), 0).unwrap();

    n0.remove(true).unwrap();
    assert!(dist.cached_shards().get_notifyables(50).unwrap().is_empty());
}
