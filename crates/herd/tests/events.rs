//! User events: masked delivery, remote-change fan-out, timers and the
//! end event.

mod common;

use std::sync::mpsc;
use std::time::Duration;

use common::{factory, node, store, WAIT};
use herd::keys::NOTIFYABLE_LOCK;
use herd::{AccessMode, EventMask, LockMode, UserEventHandler};
use serde_json::json;

#[test]
fn remote_publish_fans_out_to_matching_handlers() {
    let store = store();
    let (_f0, c0) = factory(&store);
    let (_f1, c1) = factory(&store);

    let plist1 = node(&c1, "app", "g", "n")
        .property_list("conf", AccessMode::CreateIfMissing)
        .unwrap();

    let (tx, rx) = mpsc::channel();
    c1.register_handler(UserEventHandler::new(
        &plist1,
        EventMask::PROPLIST_VALUES_CHANGE,
        move |event| {
            tx.send(event.clone()).unwrap();
        },
    ));

    // A non-matching handler must stay silent.
    let (quiet_tx, quiet_rx) = mpsc::channel();
    c1.register_handler(UserEventHandler::new(
        &plist1,
        EventMask::SHARDS_CHANGE,
        move |event| {
            quiet_tx.send(event.clone()).unwrap();
        },
    ));

    let plist0 = node(&c0, "app", "g", "n")
        .property_list("conf", AccessMode::CreateIfMissing)
        .unwrap();
    plist0.acquire_lock(NOTIFYABLE_LOCK, LockMode::Exclusive).unwrap();
    plist0.cached_key_values().set("k", json!("v")).unwrap();
    plist0.cached_key_values().publish().unwrap();
    plist0.release_lock(NOTIFYABLE_LOCK).unwrap();

    let event = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(event.key, plist1.key());
    assert!(event.mask.intersects(EventMask::PROPLIST_VALUES_CHANGE));
    assert!(quiet_rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn own_publish_emits_no_local_value_event() {
    let store = store();
    let (f0, c0) = factory(&store);

    let plist = node(&c0, "app", "g", "n")
        .property_list("conf", AccessMode::CreateIfMissing)
        .unwrap();
    let (tx, rx) = mpsc::channel();
    c0.register_handler(UserEventHandler::new(
        &plist,
        EventMask::PROPLIST_VALUES_CHANGE,
        move |event| {
            tx.send(event.clone()).unwrap();
        },
    ));

    plist.acquire_lock(NOTIFYABLE_LOCK, LockMode::Exclusive).unwrap();
    plist.cached_key_values().set("k", json!(1)).unwrap();
    plist.cached_key_values().publish().unwrap();
    plist.release_lock(NOTIFYABLE_LOCK).unwrap();

    f0.synchronize().unwrap();
    // The publisher's cache was already current; no value event fires.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn unregistered_handlers_stop_firing() {
    let store = store();
    let (_f0, c0) = factory(&store);
    let (_f1, c1) = factory(&store);

    let q1 = node(&c1, "app", "g", "n")
        .queue("q", AccessMode::CreateIfMissing)
        .unwrap();
    let (tx, rx) = mpsc::channel();
    let id = c1.register_handler(UserEventHandler::new(
        &q1,
        EventMask::QUEUE_CHILD_CHANGE,
        move |event| {
            tx.send(event.clone()).unwrap();
        },
    ));

    let q0 = node(&c0, "app", "g", "n")
        .queue("q", AccessMode::LoadIfPresent)
        .unwrap();
    q0.put(b"one").unwrap();
    rx.recv_timeout(WAIT).unwrap();

    assert!(c1.unregister_handler(id));
    assert!(!c1.unregister_handler(id));

    q0.put(b"two").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn timers_fire_once_and_cancel_idempotently() {
    let store = store();
    let (_f, c) = factory(&store);

    let (tx, rx) = mpsc::channel();
    c.register_timer(Duration::from_millis(20), json!({"n": 7}), move |_id, payload| {
        tx.send(payload.clone()).unwrap();
    })
    .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), json!({"n": 7}));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    let (never_tx, never_rx) = mpsc::channel::<serde_json::Value>();
    let id = c
        .register_timer(Duration::from_millis(100), json!(null), move |_id, payload| {
            never_tx.send(payload.clone()).unwrap();
        })
        .unwrap();
    assert!(c.cancel_timer(id));
    // A second cancel returns false.
    assert!(!c.cancel_timer(id));
    assert!(never_rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn end_event_is_delivered_exactly_once() {
    let store = store();
    let (f, c) = factory(&store);

    let (tx, rx) = mpsc::channel();
    c.register_handler(UserEventHandler::for_key(
        "",
        EventMask::END_EVENT,
        move |event| {
            tx.send(event.mask).unwrap();
        },
    ));

    f.shutdown();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), EventMask::END_EVENT);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    // Cancellable waits fail after shutdown.
    let result = c.register_timer(Duration::from_millis(1), json!(null), |_, _| {});
    assert!(matches!(result, Err(herd::Error::OperationCancelled)));
}

#[test]
fn state_records_flow_between_clients() {
    let store = store();
    let (_f0, c0) = factory(&store);
    let (f1, c1) = factory(&store);

    let node0 = node(&c0, "app", "g", "n");
    node0.acquire_lock(NOTIFYABLE_LOCK, LockMode::Exclusive).unwrap();
    let state = node0.cached_current_state();
    state.set("HEALTH", json!("good")).unwrap();
    state.publish().unwrap();
    state.set("load", json!(0.7)).unwrap();
    state.publish().unwrap();
    node0.release_lock(NOTIFYABLE_LOCK).unwrap();

    let node1 = node(&c1, "app", "g", "n");
    f1.synchronize().unwrap();
    let state1 = node1.cached_current_state();
    assert_eq!(state1.get("HEALTH").unwrap(), Some(json!("good")));
    // Earlier keys carry forward into the newest snapshot.
    assert_eq!(state1.get("load").unwrap(), Some(json!(0.7)));
    let history = state1.history().unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].timestamp <= history[1].timestamp);
}

#[test]
fn connection_flag_tracks_the_owner() {
    let store = store();
    let (_f0, c0) = factory(&store);
    let (f1, c1) = factory(&store);

    let node0 = node(&c0, "app", "g", "n");
    let node1 = node(&c1, "app", "g", "n");
    assert!(!node1.is_connected().unwrap());

    node0.announce_connected().unwrap();
    f1.synchronize().unwrap();
    assert!(node1.is_connected().unwrap());

    // Double announcement is refused.
    assert!(matches!(
        node1.announce_connected(),
        Err(herd::Error::InvalidMethod(_))
    ));

    node0.retire_connected().unwrap();
    f1.synchronize().unwrap();
    assert!(!node1.is_connected().unwrap());
}
