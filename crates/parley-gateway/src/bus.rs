use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::UserId;

pub type ConnectionId = Uuid;
pub type EventReceiver = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// Group every live connection of a user belongs to.
pub fn user_group(user_id: UserId) -> String {
    format!("user:{}", user_id)
}

/// Process-wide publish/subscribe keyed by group name.
///
/// Delivery is at-most-once and best-effort: nothing is buffered for groups
/// with no live members, and a member that went away is skipped. Events
/// published to one group from one task arrive at each member in publish order.
#[derive(Clone, Default)]
pub struct Fanout {
    inner: Arc<FanoutInner>,
}

#[derive(Default)]
struct FanoutInner {
    /// group -> (connection id -> sender)
    groups: RwLock<HashMap<String, HashMap<ConnectionId, mpsc::UnboundedSender<Arc<ServerEvent>>>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `group` with a fresh connection id. Membership lasts until the
    /// returned handle is left or dropped.
    pub fn subscribe(&self, group: impl Into<String>) -> (Membership, EventReceiver) {
        let group = group.into();
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let first = {
            let mut groups = self.inner.groups.write().unwrap_or_else(PoisonError::into_inner);
            let members = groups.entry(group.clone()).or_default();
            members.insert(id, tx);
            members.len() == 1
        };
        debug!("Connection {} joined {} (first: {})", id, group, first);

        let membership = Membership {
            fanout: self.clone(),
            group,
            id,
            first,
            left: false,
        };
        (membership, rx)
    }

    /// Deliver `event` to every live member of `group`. Returns how many
    /// members it was handed to.
    pub fn publish(&self, group: &str, event: ServerEvent) -> usize {
        let groups = self.inner.groups.read().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = groups.get(group) else {
            return 0;
        };

        let event = Arc::new(event);
        members
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    pub fn publish_to_user(&self, user_id: UserId, event: ServerEvent) -> usize {
        self.publish(&user_group(user_id), event)
    }

    pub fn member_count(&self, group: &str) -> usize {
        let groups = self.inner.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.get(group).map_or(0, HashMap::len)
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.member_count(&user_group(user_id)) > 0
    }

    /// Returns true if this removed the group's last member.
    fn remove(&self, group: &str, id: ConnectionId) -> bool {
        let mut groups = self.inner.groups.write().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = groups.get_mut(group) else {
            return false;
        };
        if members.remove(&id).is_none() {
            return false;
        }
        if members.is_empty() {
            groups.remove(group);
            return true;
        }
        false
    }
}

/// A connection's place in a group. Released on [`Membership::leave`] or drop.
pub struct Membership {
    fanout: Fanout,
    group: String,
    id: ConnectionId,
    first: bool,
    left: bool,
}

impl Membership {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Whether the group was empty before this member joined.
    pub fn is_first(&self) -> bool {
        self.first
    }

    /// Leave the group. Returns true if this was its last member.
    pub fn leave(mut self) -> bool {
        self.left = true;
        let last = self.fanout.remove(&self.group, self.id);
        debug!("Connection {} left {} (last: {})", self.id, self.group, last);
        last
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if !self.left {
            self.fanout.remove(&self.group, self.id);
        }
    }
}
