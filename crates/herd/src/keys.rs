//! The key grammar of the repository namespace.
//!
//! Every object lives at a canonical slash-separated key. Reserved tokens
//! begin with `_` so they can never collide with user-chosen names, which
//! must not begin with `_`. Object keys alternate container tokens and
//! names (`.../_groups/workers/_nodes/n0`); the data children of an object
//! (shards, state records, lock directories, queue elements) hang one level
//! below it under further reserved tokens.

pub const SEPARATOR: &str = "/";

pub const NAMESPACE: &str = "_clusterlib";
pub const NAMESPACE_VERSION: &str = "_1.0";
pub const ROOT: &str = "_root";

pub const APPLICATIONS: &str = "_applications";
pub const GROUPS: &str = "_groups";
pub const NODES: &str = "_nodes";
pub const PROCESS_SLOTS: &str = "_processSlots";
pub const DISTRIBUTIONS: &str = "_distributions";
pub const PROPERTY_LIST: &str = "_propertyList";
pub const QUEUES: &str = "_queues";
pub const LOCKS: &str = "_locks";

pub const SHARDS: &str = "_shards";
pub const ELEMENTS: &str = "_elements";
pub const CLIENT_STATE: &str = "_clientState";
pub const MASTER_SET_STATE: &str = "_masterSetState";
pub const CONNECTED: &str = "_connected";
pub const PROCESS_SLOTS_USAGE: &str = "_processSlotsUsage";
pub const PROCESS_SLOTS_MAX: &str = "_processSlotsMax";
pub const PROCESS_SLOT_PORT_VEC: &str = "_processSlotPortVec";
pub const PROCESS_SLOT_EXEC_ARGS: &str = "_processSlotExecArgs";
pub const PROCESS_SLOT_RUNNING_EXEC_ARGS: &str = "_processSlotRunningExecArgs";
pub const PROCESS_SLOT_PID: &str = "_processSlotPID";
pub const PROCESS_SLOT_DESIRED_STATE: &str = "_processSlotDesiredState";
pub const PROCESS_SLOT_CURRENT_STATE: &str = "_processSlotCurrentState";
pub const PROCESS_SLOT_RESERVATION: &str = "_processSlotReservation";

/// Lock taken to serialise structural mutation of a notifyable.
pub const NOTIFYABLE_LOCK: &str = "_notifyableLock";
/// Lock backing leader election within a group.
pub const LEADER_LOCK: &str = "_leaderLock";

pub const DEFAULT_PROPERTY_LIST: &str = "_defaultPropertyList";

/// Separates the owner field of a lock bid from its mode letter.
pub const BID_SPLIT: &str = "=";

/// Key under the current-state records carrying a pass-through health value.
pub const HEALTH_KEY: &str = "HEALTH";

const ROOT_COMPONENTS: usize = 4;
const APP_COMPONENTS: usize = 6;

/// The object kinds of the namespace, mirroring the legal key shapes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Kind {
    Root,
    Application,
    Group,
    Node,
    ProcessSlot,
    DataDistribution,
    PropertyList,
    Queue,
}

impl Kind {
    /// The container token under which children of this kind are filed.
    pub fn container(&self) -> &'static str {
        match self {
            Kind::Root => ROOT,
            Kind::Application => APPLICATIONS,
            Kind::Group => GROUPS,
            Kind::Node => NODES,
            Kind::ProcessSlot => PROCESS_SLOTS,
            Kind::DataDistribution => DISTRIBUTIONS,
            Kind::PropertyList => PROPERTY_LIST,
            Kind::Queue => QUEUES,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Kind::Root => "root",
            Kind::Application => "application",
            Kind::Group => "group",
            Kind::Node => "node",
            Kind::ProcessSlot => "process slot",
            Kind::DataDistribution => "data distribution",
            Kind::PropertyList => "property list",
            Kind::Queue => "queue",
        };
        f.write_str(s)
    }
}

/// A user-chosen name is legal if it is non-empty, contains no separator,
/// and does not begin with `_` (the reserved-token prefix).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(SEPARATOR) && !name.starts_with('_')
}

pub fn root_key() -> String {
    format!("{SEPARATOR}{NAMESPACE}{SEPARATOR}{NAMESPACE_VERSION}{SEPARATOR}{ROOT}")
}

pub fn child_key(parent_key: &str, kind: Kind, name: &str) -> String {
    format!("{parent_key}{SEPARATOR}{}{SEPARATOR}{name}", kind.container())
}

/// Key of a data child (a reserved token) directly under an object.
pub fn meta_key(object_key: &str, token: &str) -> String {
    format!("{object_key}{SEPARATOR}{token}")
}

pub fn locks_key(object_key: &str) -> String {
    meta_key(object_key, LOCKS)
}

pub fn lock_key(object_key: &str, lock_name: &str) -> String {
    format!("{object_key}{SEPARATOR}{LOCKS}{SEPARATOR}{lock_name}")
}

/// Prefix of a lock bid node: `<owner>=<mode>`, to which the store appends
/// the sequence suffix.
pub fn lock_bid_prefix(object_key: &str, lock_name: &str, owner: &str, mode: char) -> String {
    format!("{}{SEPARATOR}{owner}{BID_SPLIT}{mode}", lock_key(object_key, lock_name))
}

pub fn split(key: &str) -> Vec<&str> {
    key.split(SEPARATOR).collect()
}

pub fn is_root_key(c: &[&str]) -> bool {
    c.len() == ROOT_COMPONENTS
        && c[0].is_empty()
        && c[1] == NAMESPACE
        && c[2] == NAMESPACE_VERSION
        && c[3] == ROOT
}

pub fn is_application_key(c: &[&str]) -> bool {
    c.len() == APP_COMPONENTS
        && is_root_key(&c[..ROOT_COMPONENTS])
        && c[c.len() - 2] == APPLICATIONS
        && is_valid_name(c[c.len() - 1])
}

pub fn is_group_key(c: &[&str]) -> bool {
    if c.len() < APP_COMPONENTS || (c.len() - ROOT_COMPONENTS) % 2 != 0 {
        return false;
    }
    if c.len() == APP_COMPONENTS {
        return is_application_key(c);
    }
    is_group_key(&c[..c.len() - 2])
        && c[c.len() - 2] == GROUPS
        && is_valid_name(c[c.len() - 1])
}

pub fn is_node_key(c: &[&str]) -> bool {
    c.len() >= APP_COMPONENTS + 2
        && (c.len() - ROOT_COMPONENTS) % 2 == 0
        && is_group_key(&c[..c.len() - 2])
        && c[c.len() - 2] == NODES
        && is_valid_name(c[c.len() - 1])
}

pub fn is_process_slot_key(c: &[&str]) -> bool {
    c.len() >= APP_COMPONENTS + 4
        && (c.len() - ROOT_COMPONENTS) % 2 == 0
        && is_node_key(&c[..c.len() - 2])
        && c[c.len() - 2] == PROCESS_SLOTS
        && is_valid_name(c[c.len() - 1])
}

fn is_branch_key(c: &[&str]) -> bool {
    is_root_key(c) || is_group_key(c) || is_node_key(c) || is_process_slot_key(c)
}

pub fn is_data_distribution_key(c: &[&str]) -> bool {
    c.len() >= APP_COMPONENTS
        && (c.len() - ROOT_COMPONENTS) % 2 == 0
        && is_branch_key(&c[..c.len() - 2])
        && c[c.len() - 2] == DISTRIBUTIONS
        && is_valid_name(c[c.len() - 1])
}

pub fn is_property_list_key(c: &[&str]) -> bool {
    c.len() >= APP_COMPONENTS
        && (c.len() - ROOT_COMPONENTS) % 2 == 0
        && is_branch_key(&c[..c.len() - 2])
        && c[c.len() - 2] == PROPERTY_LIST
        && (is_valid_name(c[c.len() - 1]) || c[c.len() - 1] == DEFAULT_PROPERTY_LIST)
}

pub fn is_queue_key(c: &[&str]) -> bool {
    c.len() >= APP_COMPONENTS
        && (c.len() - ROOT_COMPONENTS) % 2 == 0
        && is_branch_key(&c[..c.len() - 2])
        && c[c.len() - 2] == QUEUES
        && is_valid_name(c[c.len() - 1])
}

/// The object kind a component vector spells, if any.
pub fn kind_of(c: &[&str]) -> Option<Kind> {
    if is_root_key(c) {
        Some(Kind::Root)
    } else if is_application_key(c) {
        Some(Kind::Application)
    } else if is_group_key(c) {
        Some(Kind::Group)
    } else if is_node_key(c) {
        Some(Kind::Node)
    } else if is_process_slot_key(c) {
        Some(Kind::ProcessSlot)
    } else if is_data_distribution_key(c) {
        Some(Kind::DataDistribution)
    } else if is_property_list_key(c) {
        Some(Kind::PropertyList)
    } else if is_queue_key(c) {
        Some(Kind::Queue)
    } else {
        None
    }
}

pub fn is_notifyable_key(key: &str) -> bool {
    kind_of(&split(key)).is_some()
}

/// Trim an arbitrary store path to its nearest enclosing object key.
/// Returns `None` when no prefix of the path is an object key.
pub fn nearest_notifyable_key(path: &str) -> Option<String> {
    let c = split(path);
    for n in (ROOT_COMPONENTS..=c.len()).rev() {
        if kind_of(&c[..n]).is_some() {
            return Some(c[..n].join(SEPARATOR));
        }
    }
    None
}

/// Key of the object enclosing `key`, skipping over the object itself.
/// For `/..._root/_applications/a/_groups/g` this yields the application key.
pub fn enclosing_object_key(key: &str) -> Option<String> {
    let c = split(key);
    if c.len() < ROOT_COMPONENTS + 2 {
        return None;
    }
    let trimmed = &c[..c.len() - 2];
    if kind_of(trimmed).is_some() {
        return Some(trimmed.join(SEPARATOR));
    }
    None
}

/// One object along a parsed key, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub kind: Kind,
    pub name: String,
    pub key: String,
}

/// Parse an object key into its ancestry chain (root first, self last).
pub fn parse_path(key: &str) -> Option<Vec<PathStep>> {
    let c = split(key);
    kind_of(&c)?;

    let mut steps = vec![PathStep {
        kind: Kind::Root,
        name: ROOT.to_string(),
        key: root_key(),
    }];
    let mut n = ROOT_COMPONENTS;
    while n < c.len() {
        n += 2;
        let kind = kind_of(&c[..n])?;
        steps.push(PathStep {
            kind,
            name: c[n - 1].to_string(),
            key: c[..n].join(SEPARATOR),
        });
    }
    Some(steps)
}

#[cfg(test)]
mod test {
    use super::*;

    fn app_key(name: &str) -> String {
        child_key(&root_key(), Kind::Application, name)
    }

    #[test]
    fn root_key_shape() {
        assert_eq!(root_key(), "/_clusterlib/_1.0/_root");
        assert!(is_root_key(&split(&root_key())));
        assert!(is_notifyable_key(&root_key()));
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("red"));
        assert!(is_valid_name("n-0.7"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("_reserved"));
        assert!(!is_valid_name("a/b"));
    }

    #[test]
    fn recognises_each_kind() {
        let app = app_key("a");
        let group = child_key(&app, Kind::Group, "g");
        let sub = child_key(&group, Kind::Group, "h");
        let node = child_key(&sub, Kind::Node, "n");
        let slot = child_key(&node, Kind::ProcessSlot, "s");
        let dist = child_key(&group, Kind::DataDistribution, "d");
        let plist = child_key(&node, Kind::PropertyList, "p");
        let queue = child_key(&app, Kind::Queue, "q");

        assert_eq!(kind_of(&split(&app)), Some(Kind::Application));
        assert_eq!(kind_of(&split(&group)), Some(Kind::Group));
        assert_eq!(kind_of(&split(&sub)), Some(Kind::Group));
        assert_eq!(kind_of(&split(&node)), Some(Kind::Node));
        assert_eq!(kind_of(&split(&slot)), Some(Kind::ProcessSlot));
        assert_eq!(kind_of(&split(&dist)), Some(Kind::DataDistribution));
        assert_eq!(kind_of(&split(&plist)), Some(Kind::PropertyList));
        assert_eq!(kind_of(&split(&queue)), Some(Kind::Queue));
    }

    #[test]
    fn nodes_may_live_under_applications() {
        // An application acts as a group for containment purposes.
        let node = child_key(&app_key("a"), Kind::Node, "n");
        assert_eq!(kind_of(&split(&node)), Some(Kind::Node));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert_eq!(kind_of(&split("/_clusterlib/_1.0")), None);
        assert_eq!(kind_of(&split("/_clusterlib/_1.0/_root/_applications")), None);
        // A reserved name in an object position.
        let bad = child_key(&root_key(), Kind::Application, "_sneaky");
        assert_eq!(kind_of(&split(&bad)), None);
        // A group cannot hang directly off the root.
        let bad = child_key(&root_key(), Kind::Group, "g");
        assert_eq!(kind_of(&split(&bad)), None);
        // A process slot must sit under a node.
        let bad = child_key(&app_key("a"), Kind::ProcessSlot, "s");
        assert_eq!(kind_of(&split(&bad)), None);
    }

    #[test]
    fn default_property_list_name_is_legal() {
        let plist = child_key(&app_key("a"), Kind::PropertyList, DEFAULT_PROPERTY_LIST);
        assert_eq!(kind_of(&split(&plist)), Some(Kind::PropertyList));
    }

    #[test]
    fn trims_to_nearest_object() {
        let node = child_key(&child_key(&app_key("a"), Kind::Group, "g"), Kind::Node, "n");

        let shards = meta_key(&node, CLIENT_STATE);
        assert_eq!(nearest_notifyable_key(&shards), Some(node.clone()));

        let bid = format!("{}/bid=X0000000004", lock_key(&node, NOTIFYABLE_LOCK));
        assert_eq!(nearest_notifyable_key(&bid), Some(node.clone()));

        assert_eq!(nearest_notifyable_key(&node), Some(node.clone()));
        assert_eq!(nearest_notifyable_key("/somewhere/else"), None);
    }

    #[test]
    fn enclosing_object_skips_the_container() {
        let app = app_key("a");
        let group = child_key(&app, Kind::Group, "g");
        let plist = child_key(&group, Kind::PropertyList, "p");

        assert_eq!(enclosing_object_key(&plist), Some(group.clone()));
        assert_eq!(enclosing_object_key(&group), Some(app.clone()));
        assert_eq!(enclosing_object_key(&app), Some(root_key()));
        assert_eq!(enclosing_object_key(&root_key()), None);
    }

    #[test]
    fn parses_ancestry() {
        let group = child_key(&app_key("a"), Kind::Group, "g");
        let dist = child_key(&group, Kind::DataDistribution, "d");

        let steps = parse_path(&dist).unwrap();
        let kinds: Vec<Kind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![Kind::Root, Kind::Application, Kind::Group, Kind::DataDistribution]
        );
        assert_eq!(steps[1].name, "a");
        assert_eq!(steps[3].key, dist);
        assert_eq!(parse_path("/not/a/key"), None);
    }
}
