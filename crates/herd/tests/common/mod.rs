//! Shared fixture: several factories over one in-process store stand in
//! for several coordinating processes.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use herd::store::MemoryStore;
use herd::{AccessMode, Application, Client, Config, Factory, Group, Node};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn factory(store: &Arc<MemoryStore>) -> (Factory, Client) {
    let factory = Factory::open(store.clone(), Config::default()).expect("factory opens");
    let client = factory.create_client();
    (factory, client)
}

pub fn app(client: &Client, name: &str) -> Application {
    client
        .root()
        .expect("root loads")
        .application(name, AccessMode::CreateIfMissing)
        .expect("application available")
}

pub fn group(client: &Client, app_name: &str, name: &str) -> Group {
    app(client, app_name)
        .group(name, AccessMode::CreateIfMissing)
        .expect("group available")
}

pub fn node(client: &Client, app_name: &str, group_name: &str, name: &str) -> Node {
    group(client, app_name, group_name)
        .node(name, AccessMode::CreateIfMissing)
        .expect("node available")
}
