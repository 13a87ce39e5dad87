//! Typed change kinds and the user-event bitmask.

use crate::keys;
use crate::store::StoreEvent;

/// The closed set of cache-change kinds. Each armed watch is bookkept under
/// exactly one of these, paired with the watched path.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    NotifyableState,
    Applications,
    Groups,
    DataDistributions,
    Nodes,
    ProcessSlots,
    PropertyLists,
    PropertyListValues,
    Shards,
    NodeClientState,
    NodeMasterSetState,
    NodeConnection,
    Synchronize,
    PrecLockNodeExists,
    QueueChildren,
    ProcessSlotsUsage,
    ProcessSlotPortVec,
    ProcessSlotExecArgs,
    ProcessSlotRunningExecArgs,
    ProcessSlotPid,
    ProcessSlotDesiredState,
    ProcessSlotCurrentState,
    ProcessSlotReservation,
}

/// Bitmask of user-visible event categories. Handlers register with the
/// union of the bits they care about.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READY: EventMask = EventMask(1 << 0);
    pub const DELETED: EventMask = EventMask(1 << 1);
    pub const STATE_CHANGE: EventMask = EventMask(1 << 2);
    pub const APPS_CHANGE: EventMask = EventMask(1 << 3);
    pub const GROUPS_CHANGE: EventMask = EventMask(1 << 4);
    pub const DISTS_CHANGE: EventMask = EventMask(1 << 5);
    pub const NODES_CHANGE: EventMask = EventMask(1 << 6);
    pub const PROCESS_SLOTS_CHANGE: EventMask = EventMask(1 << 7);
    pub const PROPLISTS_CHANGE: EventMask = EventMask(1 << 8);
    pub const PROPLIST_VALUES_CHANGE: EventMask = EventMask(1 << 9);
    pub const SHARDS_CHANGE: EventMask = EventMask(1 << 10);
    pub const CLIENT_STATE_CHANGE: EventMask = EventMask(1 << 11);
    pub const MASTER_SET_STATE_CHANGE: EventMask = EventMask(1 << 12);
    pub const CONNECTION_CHANGE: EventMask = EventMask(1 << 13);
    pub const QUEUE_CHILD_CHANGE: EventMask = EventMask(1 << 14);
    pub const SLOTS_USAGE_CHANGE: EventMask = EventMask(1 << 15);
    pub const SLOT_PORT_VEC_CHANGE: EventMask = EventMask(1 << 16);
    pub const SLOT_EXEC_ARGS_CHANGE: EventMask = EventMask(1 << 17);
    pub const SLOT_RUNNING_EXEC_ARGS_CHANGE: EventMask = EventMask(1 << 18);
    pub const SLOT_PID_CHANGE: EventMask = EventMask(1 << 19);
    pub const SLOT_DESIRED_STATE_CHANGE: EventMask = EventMask(1 << 20);
    pub const SLOT_CURRENT_STATE_CHANGE: EventMask = EventMask(1 << 21);
    pub const SLOT_RESERVATION_CHANGE: EventMask = EventMask(1 << 22);
    /// Delivered exactly once per client at factory shutdown.
    pub const END_EVENT: EventMask = EventMask(1 << 23);

    /// Every bit except [`EventMask::END_EVENT`].
    pub const ALL: EventMask = EventMask((1 << 23) - 1);

    pub fn intersects(&self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for EventMask {
    type Output = EventMask;
    fn bitand(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & rhs.0)
    }
}

impl std::fmt::Debug for EventMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: &[(u32, &str)] = &[
            (1 << 0, "READY"),
            (1 << 1, "DELETED"),
            (1 << 2, "STATE_CHANGE"),
            (1 << 3, "APPS_CHANGE"),
            (1 << 4, "GROUPS_CHANGE"),
            (1 << 5, "DISTS_CHANGE"),
            (1 << 6, "NODES_CHANGE"),
            (1 << 7, "PROCESS_SLOTS_CHANGE"),
            (1 << 8, "PROPLISTS_CHANGE"),
            (1 << 9, "PROPLIST_VALUES_CHANGE"),
            (1 << 10, "SHARDS_CHANGE"),
            (1 << 11, "CLIENT_STATE_CHANGE"),
            (1 << 12, "MASTER_SET_STATE_CHANGE"),
            (1 << 13, "CONNECTION_CHANGE"),
            (1 << 14, "QUEUE_CHILD_CHANGE"),
            (1 << 15, "SLOTS_USAGE_CHANGE"),
            (1 << 16, "SLOT_PORT_VEC_CHANGE"),
            (1 << 17, "SLOT_EXEC_ARGS_CHANGE"),
            (1 << 18, "SLOT_RUNNING_EXEC_ARGS_CHANGE"),
            (1 << 19, "SLOT_PID_CHANGE"),
            (1 << 20, "SLOT_DESIRED_STATE_CHANGE"),
            (1 << 21, "SLOT_CURRENT_STATE_CHANGE"),
            (1 << 22, "SLOT_RESERVATION_CHANGE"),
            (1 << 23, "END_EVENT"),
        ];
        if self.0 == 0 {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl ChangeKind {
    /// The user-event category a change of this kind surfaces as.
    pub fn user_mask(&self) -> EventMask {
        match self {
            ChangeKind::NotifyableState => EventMask::STATE_CHANGE,
            ChangeKind::Applications => EventMask::APPS_CHANGE,
            ChangeKind::Groups => EventMask::GROUPS_CHANGE,
            ChangeKind::DataDistributions => EventMask::DISTS_CHANGE,
            ChangeKind::Nodes => EventMask::NODES_CHANGE,
            ChangeKind::ProcessSlots => EventMask::PROCESS_SLOTS_CHANGE,
            ChangeKind::PropertyLists => EventMask::PROPLISTS_CHANGE,
            ChangeKind::PropertyListValues => EventMask::PROPLIST_VALUES_CHANGE,
            ChangeKind::Shards => EventMask::SHARDS_CHANGE,
            ChangeKind::NodeClientState => EventMask::CLIENT_STATE_CHANGE,
            ChangeKind::NodeMasterSetState => EventMask::MASTER_SET_STATE_CHANGE,
            ChangeKind::NodeConnection => EventMask::CONNECTION_CHANGE,
            ChangeKind::Synchronize => EventMask::NONE,
            ChangeKind::PrecLockNodeExists => EventMask::NONE,
            ChangeKind::QueueChildren => EventMask::QUEUE_CHILD_CHANGE,
            ChangeKind::ProcessSlotsUsage => EventMask::SLOTS_USAGE_CHANGE,
            ChangeKind::ProcessSlotPortVec => EventMask::SLOT_PORT_VEC_CHANGE,
            ChangeKind::ProcessSlotExecArgs => EventMask::SLOT_EXEC_ARGS_CHANGE,
            ChangeKind::ProcessSlotRunningExecArgs => EventMask::SLOT_RUNNING_EXEC_ARGS_CHANGE,
            ChangeKind::ProcessSlotPid => EventMask::SLOT_PID_CHANGE,
            ChangeKind::ProcessSlotDesiredState => EventMask::SLOT_DESIRED_STATE_CHANGE,
            ChangeKind::ProcessSlotCurrentState => EventMask::SLOT_CURRENT_STATE_CHANGE,
            ChangeKind::ProcessSlotReservation => EventMask::SLOT_RESERVATION_CHANGE,
        }
    }
}

/// Map a raw store event to the change kinds that may be armed for it.
///
/// A single store watch can stand in for several logical arms (an object's
/// own node carries both its lifecycle watch and, for a property list, its
/// values watch); the pipeline consults the callback-ready table for each
/// candidate in the returned order.
pub fn classify(event: &StoreEvent) -> Vec<ChangeKind> {
    let path = match event {
        StoreEvent::SyncMarker { .. } => return vec![ChangeKind::Synchronize],
        StoreEvent::SessionExpired => return Vec::new(),
        other => match other.path() {
            Some(p) => p,
            None => return Vec::new(),
        },
    };

    let sep = format!("{}{}{}", keys::SEPARATOR, keys::LOCKS, keys::SEPARATOR);
    if path.contains(&sep) {
        return vec![ChangeKind::PrecLockNodeExists];
    }

    let last = path.rsplit(keys::SEPARATOR).next().unwrap_or_default();
    let by_token = match last {
        keys::APPLICATIONS => Some(ChangeKind::Applications),
        keys::GROUPS => Some(ChangeKind::Groups),
        keys::NODES => Some(ChangeKind::Nodes),
        keys::PROCESS_SLOTS => Some(ChangeKind::ProcessSlots),
        keys::DISTRIBUTIONS => Some(ChangeKind::DataDistributions),
        keys::PROPERTY_LIST => Some(ChangeKind::PropertyLists),
        keys::SHARDS => Some(ChangeKind::Shards),
        keys::ELEMENTS => Some(ChangeKind::QueueChildren),
        keys::CLIENT_STATE => Some(ChangeKind::NodeClientState),
        keys::MASTER_SET_STATE => Some(ChangeKind::NodeMasterSetState),
        keys::CONNECTED => Some(ChangeKind::NodeConnection),
        keys::PROCESS_SLOTS_USAGE | keys::PROCESS_SLOTS_MAX => Some(ChangeKind::ProcessSlotsUsage),
        keys::PROCESS_SLOT_PORT_VEC => Some(ChangeKind::ProcessSlotPortVec),
        keys::PROCESS_SLOT_EXEC_ARGS => Some(ChangeKind::ProcessSlotExecArgs),
        keys::PROCESS_SLOT_RUNNING_EXEC_ARGS => Some(ChangeKind::ProcessSlotRunningExecArgs),
        keys::PROCESS_SLOT_PID => Some(ChangeKind::ProcessSlotPid),
        keys::PROCESS_SLOT_DESIRED_STATE => Some(ChangeKind::ProcessSlotDesiredState),
        keys::PROCESS_SLOT_CURRENT_STATE => Some(ChangeKind::ProcessSlotCurrentState),
        keys::PROCESS_SLOT_RESERVATION => Some(ChangeKind::ProcessSlotReservation),
        _ => None,
    };
    if let Some(kind) = by_token {
        return vec![kind];
    }

    let components = keys::split(path);
    if keys::is_property_list_key(&components) {
        return vec![ChangeKind::PropertyListValues, ChangeKind::NotifyableState];
    }
    if keys::kind_of(&components).is_some() {
        return vec![ChangeKind::NotifyableState];
    }
    Vec::new()
}
