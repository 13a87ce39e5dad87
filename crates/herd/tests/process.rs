//! Process slots: port vectors, exec args, PID records and the liveness
//! monitor over the periodic runner.

mod common;

use std::time::Duration;

use common::{factory, node, store, WAIT};
use herd::keys::NOTIFYABLE_LOCK;
use herd::{AccessMode, ExecArgs, LockMode};
use serde_json::json;

#[test]
fn slot_records_publish_and_reload() {
    let store = store();
    let (_f0, c0) = factory(&store);
    let slot0 = node(&c0, "app", "g", "n")
        .process_slot("s0", AccessMode::CreateIfMissing)
        .unwrap();

    let args = ExecArgs {
        env: vec!["PORT=8080".into()],
        path: "/srv/worker".into(),
        command: "worker --shard 3".into(),
    };

    slot0.acquire_lock(NOTIFYABLE_LOCK, LockMode::Exclusive).unwrap();
    let info0 = slot0.cached_process_info();
    info0.set_port_vec(vec![8080, 8081]).unwrap();
    info0.publish_port_vec().unwrap();
    info0.set_exec_args(&args).unwrap();
    info0.publish_exec_args().unwrap();
    info0.set_pid(4242).unwrap();
    info0.publish_pid().unwrap();
    slot0.release_lock(NOTIFYABLE_LOCK).unwrap();

    // A second client reads everything back.
    let (f1, c1) = factory(&store);
    let slot1 = node(&c1, "app", "g", "n")
        .process_slot("s0", AccessMode::LoadIfPresent)
        .unwrap();
    f1.synchronize().unwrap();
    let info1 = slot1.cached_process_info();
    assert_eq!(info1.port_vec().unwrap(), vec![8080, 8081]);
    assert_eq!(info1.exec_args().unwrap(), Some(args));
    assert_eq!(info1.pid().unwrap(), Some(4242));
    assert_eq!(info1.running_exec_args().unwrap(), None);
}

#[test]
fn reservations_set_and_clear() {
    let store = store();
    let (_f, c) = factory(&store);
    let slot = node(&c, "app", "g", "n")
        .process_slot("s0", AccessMode::CreateIfMissing)
        .unwrap();

    slot.acquire_lock(NOTIFYABLE_LOCK, LockMode::Exclusive).unwrap();
    let info = slot.cached_process_info();
    info.set_reservation(Some("scheduler-7".into())).unwrap();
    info.publish_reservation().unwrap();
    assert_eq!(info.reservation().unwrap(), Some("scheduler-7".into()));

    info.set_reservation(None).unwrap();
    info.publish_reservation().unwrap();
    assert_eq!(info.reservation().unwrap(), None);
    slot.release_lock(NOTIFYABLE_LOCK).unwrap();
}

#[test]
fn slot_desired_and_current_state_are_separate() {
    let store = store();
    let (_f, c) = factory(&store);
    let slot = node(&c, "app", "g", "n")
        .process_slot("s0", AccessMode::CreateIfMissing)
        .unwrap();

    slot.acquire_lock(NOTIFYABLE_LOCK, LockMode::Exclusive).unwrap();
    slot.cached_desired_state().set("state", json!("running")).unwrap();
    slot.cached_desired_state().publish().unwrap();
    slot.cached_current_state().set("state", json!("starting")).unwrap();
    slot.cached_current_state().publish().unwrap();
    slot.release_lock(NOTIFYABLE_LOCK).unwrap();

    assert_eq!(
        slot.cached_desired_state().get("state").unwrap(),
        Some(json!("running"))
    );
    assert_eq!(
        slot.cached_current_state().get("state").unwrap(),
        Some(json!("starting"))
    );
}

#[test]
fn node_slot_capacity_records() {
    let store = store();
    let (_f, c) = factory(&store);
    let n = node(&c, "app", "g", "n");

    n.acquire_lock(NOTIFYABLE_LOCK, LockMode::Exclusive).unwrap();
    let usage = n.cached_slot_usage();
    usage.set_max_slots(4).unwrap();
    usage.publish_max_slots().unwrap();
    usage.set_usage(vec!["s0".into(), "s1".into()]).unwrap();
    usage.publish_usage().unwrap();
    n.release_lock(NOTIFYABLE_LOCK).unwrap();

    assert_eq!(n.cached_slot_usage().max_slots().unwrap(), Some(4));
    assert_eq!(
        n.cached_slot_usage().usage().unwrap(),
        vec!["s0".to_string(), "s1".to_string()]
    );
}

#[test]
fn health_monitor_publishes_through_current_state() {
    let store = store();
    let (f0, c0) = factory(&store);
    let node0 = node(&c0, "app", "g", "n");

    let id = f0.register_health_monitor(&node0, Duration::from_millis(30), || json!("alive"));

    // A second client eventually observes the HEALTH entry.
    let (f1, c1) = factory(&store);
    let node1 = node(&c1, "app", "g", "n");
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        f1.synchronize().unwrap();
        if node1.cached_current_state().get(herd::keys::HEALTH_KEY).unwrap()
            == Some(json!("alive"))
        {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "health entry never arrived");
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(f0.cancel_periodic(id));
    assert!(!f0.cancel_periodic(id));
}
