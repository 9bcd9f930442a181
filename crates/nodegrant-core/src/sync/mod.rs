//! Resource synchronizers
//!
//! A synchronizer drives one category of external resources toward the
//! state implied by the current membership of one key.
//!
//! | synchronizer | keys | tagged by |
//! |---|---|---|
//! | [`ReservedIpSync`] | nodes | node label |
//! | [`ReverseDnsSync`] | nodes | record comment |
//! | [`DataStoreAclSync`] | nodes | rule description |
//! | [`NodeSecurityGroupSync`] | nodes | address equality |
//! | [`ServiceSecurityGroupSync`] | services | protocol/port equality |
//!
//! Every synchronizer returns `Ok(())` when there is nothing to do (disabled,
//! no usable address, pool exhausted) and an error only when a retry may
//! help. Desired state and external state are recomputed on every call.

use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;

use crate::error::Result;
use crate::traits::Member;

pub mod datastore_acl;
pub mod reserved_ip;
pub mod reverse_dns;
pub mod security_group;

pub use datastore_acl::DataStoreAclSync;
pub use reserved_ip::ReservedIpSync;
pub use reverse_dns::ReverseDnsSync;
pub use security_group::{NodeSecurityGroupSync, ServiceSecurityGroupSync};

/// A unit reconciling one resource category for one membership key
///
/// `member` is the cached snapshot for `key`, or `None` when the key is no
/// longer part of the membership.
#[async_trait]
pub trait Synchronizer<T: Member>: Send + Sync {
    /// Short name used in logs and aggregated errors
    fn name(&self) -> &'static str;

    /// Whether the synchronizer has anything configured
    fn is_enabled(&self) -> bool;

    /// Drive the external state for `key` toward the desired state
    async fn sync(&self, key: &str, member: Option<&T>) -> Result<()>;
}

/// Single-host network for an address (/32 or /128)
pub fn host_net(address: IpAddr) -> IpNet {
    IpNet::from(address)
}
