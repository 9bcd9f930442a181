// # Resource API Trait
//
// Typed facade over the external resource-management API: compute instances,
// floating IPs, DNS zone records, data-store allow-lists and security-group
// rules.
//
// ## Implementations
//
// - Scaleway: `nodegrant-provider-scaleway` crate
//
// ## Usage
//
// ```rust,ignore
// use nodegrant_core::traits::ResourceApi;
//
// let server = api.find_server("node-1").await?;
// if let Some(ip) = server.public_ip {
//     println!("{} is reachable at {}", server.name, ip.address);
// }
// ```

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, Result};

/// Public address attached to a compute instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIp {
    /// IP identifier
    pub id: String,
    /// The address
    pub address: IpAddr,
    /// Whether the address is platform-assigned and ephemeral
    pub dynamic: bool,
}

/// A compute instance backing a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Instance identifier
    pub id: String,
    /// Instance name (matches the node name)
    pub name: String,
    /// Availability zone of the instance
    pub zone: String,
    /// Public address, if any
    pub public_ip: Option<PublicIp>,
    /// Private address, if any
    pub private_ip: Option<IpAddr>,
}

/// A floating IP owned by the project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    /// IP identifier
    pub id: String,
    /// The address
    pub address: IpAddr,
    /// Reverse pointer currently set on the address
    pub reverse: Option<String>,
    /// Identifier of the instance the IP is attached to
    pub server_id: Option<String>,
}

impl FloatingIp {
    /// Whether the IP is currently attached to an instance
    pub fn is_attached(&self) -> bool {
        self.server_id.is_some()
    }
}

/// A record of a DNS zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Record identifier (empty for records not yet created)
    #[serde(default)]
    pub id: String,
    /// Record name relative to the zone
    pub name: String,
    /// Record data (the address for A records)
    pub data: String,
    /// Record type (e.g. "A")
    #[serde(rename = "type")]
    pub record_type: String,
    /// Time-to-live in seconds
    pub ttl: u32,
    /// Free-text comment, used as the link back to a membership key
    #[serde(default)]
    pub comment: Option<String>,
}

/// Category of managed data store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStoreKind {
    /// Relational database instance (regional)
    Relational,
    /// In-memory cache cluster (zonal)
    Cache,
}

impl fmt::Display for DataStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataStoreKind::Relational => f.write_str("database"),
            DataStoreKind::Cache => f.write_str("redis"),
        }
    }
}

/// A data-store instance whose allow-list is managed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStoreInstance {
    /// Instance identifier
    pub id: String,
    /// Resolved region or zone of the instance
    pub location: String,
    /// Data-store category
    pub kind: DataStoreKind,
}

/// An allow-list entry on a data store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    /// Rule identifier, for stores that address rules by id
    #[serde(default)]
    pub id: Option<String>,
    /// Allowed network
    pub ip: IpNet,
    /// Free-text description, used as the link back to a membership key
    #[serde(default)]
    pub description: String,
}

/// Security-group rule protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

impl RuleProtocol {
    /// Protocol name as sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleProtocol::Tcp => "TCP",
            RuleProtocol::Udp => "UDP",
            RuleProtocol::Icmp => "ICMP",
            RuleProtocol::Any => "ANY",
        }
    }
}

/// Security-group rule direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Inbound,
    Outbound,
}

/// Security-group rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
}

/// Content of a security-group rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub protocol: RuleProtocol,
    pub direction: RuleDirection,
    pub action: RuleAction,
    pub ip_range: IpNet,
    #[serde(default)]
    pub dest_port_from: Option<u16>,
    #[serde(default)]
    pub dest_port_to: Option<u16>,
}

impl RuleSpec {
    /// Inbound accept rule for any protocol from a single host
    pub fn accept_host(address: IpAddr) -> Self {
        Self {
            protocol: RuleProtocol::Any,
            direction: RuleDirection::Inbound,
            action: RuleAction::Accept,
            ip_range: IpNet::from(address),
            dest_port_from: None,
            dest_port_to: None,
        }
    }

    /// Inbound accept rule for one protocol/port pair from anywhere
    pub fn accept_port(protocol: RuleProtocol, port: u16) -> Self {
        Self {
            protocol,
            direction: RuleDirection::Inbound,
            action: RuleAction::Accept,
            ip_range: any_ipv4(),
            dest_port_from: Some(port),
            dest_port_to: Some(port),
        }
    }

    /// Whether this is an inbound accept rule
    pub fn is_inbound_accept(&self) -> bool {
        self.action == RuleAction::Accept && self.direction == RuleDirection::Inbound
    }

    /// Whether this rule opens exactly `port` for `protocol`
    pub fn allows_exact_port(&self, protocol: RuleProtocol, port: u16) -> bool {
        self.is_inbound_accept()
            && self.protocol == protocol
            && self.dest_port_from == Some(port)
            && self.dest_port_to == Some(port)
    }
}

/// 0.0.0.0/0
fn any_ipv4() -> IpNet {
    let unspecified = std::net::Ipv4Addr::UNSPECIFIED;
    // prefix 0 is always valid
    IpNet::V4(Ipv4Net::new(unspecified, 0).unwrap_or_else(|_| Ipv4Net::from(unspecified)))
}

/// A rule of a security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    /// Rule identifier
    pub id: String,
    /// Rule content
    #[serde(flatten)]
    pub spec: RuleSpec,
}

/// Identifier optionally qualified with a region or zone
///
/// Written either as `id` or as `location/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedId {
    /// Resource identifier
    pub id: String,
    /// Region or zone, when given
    pub location: Option<String>,
}

impl QualifiedId {
    /// Parse a possibly qualified identifier
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` when the value contains more than one `/`.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        match parts.as_slice() {
            [id] => Ok(Self {
                id: (*id).to_string(),
                location: None,
            }),
            [location, id] => Ok(Self {
                id: (*id).to_string(),
                location: Some((*location).to_string()),
            }),
            _ => Err(Error::invalid_input(format!("couldn't parse ID {}", raw))),
        }
    }

    /// The location, if given
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}/{}", location, self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// Trait for resource API implementations
///
/// One instance is shared by every synchronizer, so implementations must be
/// thread-safe and hold no mutable state.
///
/// # Contract
///
/// - Operations are single-shot: no retries and no backoff. The controller
///   owns retry policy.
/// - Listings return the complete set (paged listings fully drained), except
///   [`ResourceApi::list_dns_records`] which returns one page.
/// - An absent location means the implementation's default zone or region.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Find the single compute instance named `name`
    ///
    /// Fails unless exactly one instance matches.
    async fn find_server(&self, name: &str) -> Result<Server>;

    /// List all floating IPs of the project
    async fn list_ips(&self) -> Result<Vec<FloatingIp>>;

    /// Attach a floating IP to an instance
    async fn attach_ip(&self, ip_id: &str, server_id: &str) -> Result<()>;

    /// Set (or clear with `None`) the reverse pointer of an address
    async fn set_ip_reverse(&self, address: IpAddr, reverse: Option<&str>) -> Result<()>;

    /// List one page (1-based) of records of `record_type` in `zone`
    async fn list_dns_records(
        &self,
        zone: &str,
        record_type: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<DnsRecord>>;

    /// Add a record to `zone`
    async fn add_dns_record(&self, zone: &str, record: &DnsRecord) -> Result<()>;

    /// Delete a record from `zone`
    async fn delete_dns_record(&self, zone: &str, record_id: &str) -> Result<()>;

    /// Fetch a data-store instance
    async fn get_data_store(&self, kind: DataStoreKind, id: &QualifiedId)
    -> Result<DataStoreInstance>;

    /// List the allow-list of a data-store instance
    async fn list_acl_rules(&self, instance: &DataStoreInstance) -> Result<Vec<AclRule>>;

    /// Add an allow-list entry
    async fn add_acl_rule(
        &self,
        instance: &DataStoreInstance,
        ip: IpNet,
        description: &str,
    ) -> Result<()>;

    /// Delete an allow-list entry
    async fn delete_acl_rule(&self, instance: &DataStoreInstance, rule: &AclRule) -> Result<()>;

    /// List the rules of a security group
    async fn list_security_group_rules(
        &self,
        zone: Option<&str>,
        group_id: &str,
    ) -> Result<Vec<SecurityGroupRule>>;

    /// Create a rule in a security group
    async fn create_security_group_rule(
        &self,
        zone: Option<&str>,
        group_id: &str,
        rule: &RuleSpec,
    ) -> Result<()>;

    /// Delete a rule from a security group
    async fn delete_security_group_rule(
        &self,
        zone: Option<&str>,
        group_id: &str,
        rule_id: &str,
    ) -> Result<()>;

    /// Get the provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}
