//! Core traits for the nodegrant system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`MembershipSource`]: Deliver cluster membership changes
//! - [`NodeLabeler`]: Write labels back onto nodes
//! - [`ResourceApi`]: Manage external cloud resources

pub mod membership;
pub mod resource_api;

pub use membership::{
    Member, MembershipSource, Node, NodeAddress, NodeAddressType, NodeLabeler, PortProtocol,
    Service, ServicePort, ServiceType, SourceEvent,
};
pub use resource_api::{
    AclRule, DataStoreInstance, DataStoreKind, DnsRecord, FloatingIp, PublicIp, QualifiedId,
    ResourceApi, RuleAction, RuleDirection, RuleProtocol, RuleSpec, SecurityGroupRule, Server,
};
