//! Removal: child-before-parent ordering, recursion, the sync barrier and
//! reference-count reclamation.

mod common;

use common::{factory, group, node, store};
use herd::keys::NOTIFYABLE_LOCK;
use herd::{AccessMode, Error, LockMode};
use serde_json::json;

#[test]
fn remove_with_children_requires_recursion() {
    let store = store();
    let (_f, c) = factory(&store);
    let g = group(&c, "app", "g");
    g.node("n", AccessMode::CreateIfMissing).unwrap();

    assert!(matches!(g.remove(false), Err(Error::InvalidMethod(_))));
    // The group survives the refused removal.
    assert!(!g.is_removed());
    assert_eq!(g.node_names().unwrap(), vec!["n"]);
}

#[test]
fn remove_leaf_then_parent() {
    let store = store();
    let (_f, c) = factory(&store);
    let g = group(&c, "app", "g");
    let n = g.node("n", AccessMode::CreateIfMissing).unwrap();

    n.remove(false).unwrap();
    assert!(n.is_removed());
    assert!(matches!(
        n.property_list("p", AccessMode::CreateIfMissing),
        Err(Error::ObjectRemoved(_))
    ));

    g.remove(false).unwrap();
    assert!(g.is_removed());
}

#[test]
fn recursive_remove_erases_every_descendant() {
    let store = store();
    let (_f0, c0) = factory(&store);

    // Build /app/g/n with a populated property list.
    let n = node(&c0, "app", "g", "n");
    let plist = n
        .property_list("default", AccessMode::CreateIfMissing)
        .unwrap();
    plist.acquire_lock(NOTIFYABLE_LOCK, LockMode::Exclusive).unwrap();
    plist.cached_key_values().set("k", json!("v")).unwrap();
    plist.cached_key_values().publish().unwrap();
    plist.release_lock(NOTIFYABLE_LOCK).unwrap();

    let g = group(&c0, "app", "g");
    let group_key = g.key().to_string();
    let node_key = n.key().to_string();
    let plist_key = plist.key().to_string();

    g.remove(true).unwrap();

    // Locally everything under the group is gone.
    assert!(g.is_removed());
    assert!(n.is_removed());
    assert!(plist.is_removed());

    // A second client (post-sync) finds no trace of the subtree.
    let (_f1, c1) = factory(&store);
    for key in [&group_key, &node_key, &plist_key] {
        assert!(
            matches!(c1.notifyable_from_key(key), Err(Error::NoNode(_))),
            "'{key}' should be gone"
        );
    }
    let app1 = c1
        .root()
        .unwrap()
        .application("app", AccessMode::LoadIfPresent)
        .unwrap();
    assert!(app1.group_names().unwrap().is_empty());
}

#[test]
fn root_cannot_be_removed() {
    let store = store();
    let (_f, c) = factory(&store);
    let root: herd::NotifyableRef = c.root().unwrap().into();
    assert!(matches!(root.remove(false), Err(Error::InvalidMethod(_))));
}

#[test]
fn removed_name_can_be_recreated_fresh() {
    let store = store();
    let (_f, c) = factory(&store);
    let g = group(&c, "app", "g");
    let n0 = g.node("n", AccessMode::CreateIfMissing).unwrap();
    n0.remove(false).unwrap();

    // Same name, new object: the removed handle stays removed.
    let n1 = g.node("n", AccessMode::CreateIfMissing).unwrap();
    assert!(!n1.is_removed());
    assert!(n0.is_removed());
    assert_ne!(n0, n1);
}

#[test]
fn removal_propagates_to_other_clients() {
    let store = store();
    let (_f0, c0) = factory(&store);
    let (f1, c1) = factory(&store);

    let g0 = group(&c0, "app", "g");
    let g1 = group(&c1, "app", "g");
    assert!(!g1.is_removed());

    g0.remove(true).unwrap();

    // The deletion watch marks the other client's cached object.
    f1.synchronize().unwrap();
    assert!(g1.is_removed());
    assert!(matches!(
        g1.node("n", AccessMode::CreateIfMissing),
        Err(Error::ObjectRemoved(_))
    ));
}
