//! Membership events and their translation into queue keys

use std::sync::Arc;

use crate::traits::{Member, Node, Service};

/// A change observed on the membership cache
#[derive(Debug, Clone)]
pub enum MembershipEvent<T> {
    /// The object was not cached before
    Added(Arc<T>),
    /// A cached object was replaced
    Updated {
        /// Previous snapshot
        old: Arc<T>,
        /// New snapshot
        new: Arc<T>,
    },
    /// The object left the membership
    Deleted(Arc<T>),
}

impl<T: Member> MembershipEvent<T> {
    /// Key of the object the event is about
    pub fn key(&self) -> String {
        match self {
            MembershipEvent::Added(item) | MembershipEvent::Deleted(item) => item.key(),
            MembershipEvent::Updated { new, .. } => new.key(),
        }
    }
}

/// Decides which membership events require a reconciliation pass
pub trait EventTranslator<T>: Send + Sync {
    /// The key to enqueue for `event`, if any
    fn translate(&self, event: &MembershipEvent<T>) -> Option<String>;
}

/// Node events: additions and deletions always, updates only when an
/// address changed or on a periodic resync
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeEvents;

impl NodeEvents {
    /// Whether an address of some type differs between the two snapshots
    ///
    /// Types present on one side only do not count.
    fn address_changed(old: &Node, new: &Node) -> bool {
        old.addresses.iter().any(|before| {
            new.addresses
                .iter()
                .any(|after| after.kind == before.kind && after.address != before.address)
        })
    }
}

impl EventTranslator<Node> for NodeEvents {
    fn translate(&self, event: &MembershipEvent<Node>) -> Option<String> {
        match event {
            MembershipEvent::Added(node) | MembershipEvent::Deleted(node) => Some(node.key()),
            MembershipEvent::Updated { old, new } => {
                // same revision: a relist delivered the object again
                if old.resource_version() == new.resource_version()
                    || Self::address_changed(old, new)
                {
                    Some(new.key())
                } else {
                    None
                }
            }
        }
    }
}

/// Service events: only externally reachable services are of interest
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceEvents;

impl EventTranslator<Service> for ServiceEvents {
    fn translate(&self, event: &MembershipEvent<Service>) -> Option<String> {
        let service = match event {
            MembershipEvent::Added(service) | MembershipEvent::Deleted(service) => service,
            MembershipEvent::Updated { new, .. } => new,
        };
        service
            .is_externally_reachable()
            .then(|| service.key())
    }
}
