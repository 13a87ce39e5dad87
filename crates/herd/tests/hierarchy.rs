//! Object-graph shape: creation, lookup, containment rules and kinds.

mod common;

use common::{app, factory, group, node, store};
use herd::{AccessMode, Error, Kind};

#[test]
fn creates_and_reloads_the_hierarchy() {
    let store = store();
    let (_f0, c0) = factory(&store);

    let app0 = app(&c0, "web");
    assert_eq!(app0.kind(), Kind::Application);
    assert_eq!(app0.name(), "web");

    let group0 = app0.group("servers", AccessMode::CreateIfMissing).unwrap();
    let node0 = group0.node("n0", AccessMode::CreateIfMissing).unwrap();
    let slot0 = node0.process_slot("s0", AccessMode::CreateIfMissing).unwrap();
    assert_eq!(slot0.kind(), Kind::ProcessSlot);
    assert!(slot0.key().ends_with("/_processSlots/s0"));

    // A second factory discovers the same objects from the store.
    let (_f1, c1) = factory(&store);
    let app1 = c1
        .root()
        .unwrap()
        .application("web", AccessMode::LoadIfPresent)
        .unwrap();
    let group1 = app1.group("servers", AccessMode::LoadIfPresent).unwrap();
    let node1 = group1.node("n0", AccessMode::LoadIfPresent).unwrap();
    assert_eq!(node1.key(), node0.key());
    assert_eq!(
        node1.process_slot_names().unwrap(),
        vec!["s0".to_string()]
    );
}

#[test]
fn load_if_present_requires_existence() {
    let store = store();
    let (_f, c) = factory(&store);
    let result = c
        .root()
        .unwrap()
        .application("ghost", AccessMode::LoadIfPresent);
    assert!(matches!(result, Err(Error::NoNode(_))));
}

#[test]
fn names_are_validated() {
    let store = store();
    let (_f, c) = factory(&store);
    let root = c.root().unwrap();

    for bad in ["", "_reserved", "a/b"] {
        assert!(matches!(
            root.application(bad, AccessMode::CreateIfMissing),
            Err(Error::InvalidArguments(_))
        ));
    }
}

#[test]
fn containment_rules_are_enforced() {
    let store = store();
    let (_f, c) = factory(&store);
    let root = c.root().unwrap();
    let app0 = app(&c, "web");
    let node0 = node(&c, "web", "g", "n0");

    // Groups hang off applications or groups, never the root.
    assert!(matches!(
        root.group("g", AccessMode::CreateIfMissing),
        Err(Error::InvalidMethod(_))
    ));
    // Process slots hang off nodes only.
    assert!(matches!(
        app0.process_slot("s", AccessMode::CreateIfMissing),
        Err(Error::InvalidMethod(_))
    ));
    // Any branch object can hold a property list or queue.
    assert!(node0.property_list("p", AccessMode::CreateIfMissing).is_ok());
    assert!(node0.queue("q", AccessMode::CreateIfMissing).is_ok());
}

#[test]
fn typed_casts_check_the_kind() {
    let store = store();
    let (_f, c) = factory(&store);
    let group0 = group(&c, "web", "servers");
    let nt: herd::NotifyableRef = group0.clone().into();

    assert!(nt.as_group().is_ok());
    assert!(matches!(nt.as_queue(), Err(Error::InvalidMethod(_))));
    assert!(matches!(nt.as_node(), Err(Error::InvalidMethod(_))));
}

#[test]
fn ancestry_accessors() {
    let store = store();
    let (_f, c) = factory(&store);
    let node0 = node(&c, "web", "servers", "n0");

    let my_app = node0.my_application().unwrap().unwrap();
    assert_eq!(my_app.name(), "web");
    let my_group = node0.my_group().unwrap().unwrap();
    assert_eq!(my_group.name(), "servers");

    // An application is its own application; the root has neither.
    let app0 = app(&c, "web");
    assert_eq!(app0.my_application().unwrap().unwrap().name(), "web");
    let root: herd::NotifyableRef = c.root().unwrap().into();
    assert!(root.my_application().unwrap().is_none());

    let parent = node0.parent().unwrap();
    assert_eq!(parent.key(), my_group.key());
}

#[test]
fn children_enumeration_spans_kinds() {
    let store = store();
    let (_f, c) = factory(&store);
    let group0 = group(&c, "web", "servers");
    group0.node("n0", AccessMode::CreateIfMissing).unwrap();
    group0.node("n1", AccessMode::CreateIfMissing).unwrap();
    group0
        .data_distribution("dist", AccessMode::CreateIfMissing)
        .unwrap();
    group0
        .property_list("conf", AccessMode::CreateIfMissing)
        .unwrap();

    let children = group0.children().unwrap();
    let mut names: Vec<&str> = children.iter().map(|c| c.name()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["conf", "dist", "n0", "n1"]);

    assert_eq!(group0.node_names().unwrap(), vec!["n0", "n1"]);
    assert_eq!(group0.data_distribution_names().unwrap(), vec!["dist"]);
}

#[test]
fn by_key_lookup_resolves_ancestry() {
    let store = store();
    let (_f0, c0) = factory(&store);
    let node0 = node(&c0, "web", "servers", "n0");

    let (_f1, c1) = factory(&store);
    let found = c1.notifyable_from_key(node0.key()).unwrap();
    assert_eq!(found.kind(), Kind::Node);
    assert_eq!(found.name(), "n0");

    assert!(matches!(
        c1.notifyable_from_key("/not/an/object"),
        Err(Error::InvalidArguments(_))
    ));
}
