// # Membership Traits
//
// Defines the cluster-membership side of the system: the objects that are
// mirrored locally (nodes and services), the feed that delivers them, and the
// update API used to write labels back onto nodes.
//
// ## Implementations
//
// - Kubernetes: `nodegrant-source-kube` crate
//
// ## Usage
//
// ```rust,ignore
// use nodegrant_core::traits::{MembershipSource, SourceEvent};
// use tokio_stream::StreamExt;
//
// let mut stream = source.watch();
// while let Some(event) = stream.next().await {
//     match event {
//         SourceEvent::Listed(nodes) => println!("bootstrap: {} nodes", nodes.len()),
//         SourceEvent::Applied(node) => println!("applied {}", node.name),
//         SourceEvent::Deleted(node) => println!("deleted {}", node.name),
//     }
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::pin::Pin;
use tokio_stream::Stream;

/// An object mirrored by the membership cache
///
/// The key is the identity used both as cache key and as queue token.
pub trait Member: Clone + Send + Sync + 'static {
    /// Unique key of this object within its category
    fn key(&self) -> String;

    /// Opaque revision marker assigned by the membership store
    fn resource_version(&self) -> &str;
}

/// Kind of address reported on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAddressType {
    Hostname,
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    #[serde(rename = "InternalIP")]
    InternalIp,
    #[serde(rename = "ExternalDNS")]
    ExternalDns,
    #[serde(rename = "InternalDNS")]
    InternalDns,
}

/// An address reported by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Address type
    pub kind: NodeAddressType,
    /// Address value as reported (not necessarily an IP)
    pub address: String,
}

impl NodeAddress {
    /// Create a new node address
    pub fn new(kind: NodeAddressType, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }
}

/// Snapshot of a cluster node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node name (the membership key)
    pub name: String,
    /// Revision marker
    pub resource_version: String,
    /// Node labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Addresses reported by the node
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
}

impl Node {
    /// Create a node with no labels and no addresses
    pub fn new(name: impl Into<String>, resource_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_version: resource_version.into(),
            ..Default::default()
        }
    }

    /// Add a reported address
    pub fn with_address(mut self, kind: NodeAddressType, address: impl Into<String>) -> Self {
        self.addresses.push(NodeAddress::new(kind, address));
        self
    }

    /// Set a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether the label `key` is set to `value`
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).is_some_and(|v| v == value)
    }

    /// Pick the reported external address, preferring IPv4
    ///
    /// Walks the external addresses in reported order: an IPv6 value is kept
    /// as a candidate and the walk continues, anything else ends the walk.
    /// The first IPv4 address therefore wins; with only IPv6 addresses the
    /// last one is returned. An unparsable value ends the walk with `None`.
    pub fn preferred_external_ip(&self) -> Option<IpAddr> {
        let mut chosen = None;
        for addr in self
            .addresses
            .iter()
            .filter(|a| a.kind == NodeAddressType::ExternalIp)
        {
            chosen = addr.address.parse::<IpAddr>().ok();
            if matches!(chosen, Some(IpAddr::V6(_))) {
                continue;
            }
            break;
        }
        chosen
    }
}

impl Member for Node {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }
}

/// How a service is exposed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    NodePort,
    LoadBalancer,
    ExternalName,
}

/// Transport protocol of a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortProtocol {
    Tcp,
    Udp,
    Sctp,
}

impl PortProtocol {
    /// Protocol name as used by both the cluster and the resource API
    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "TCP",
            PortProtocol::Udp => "UDP",
            PortProtocol::Sctp => "SCTP",
        }
    }
}

/// A port declared by a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Optional port name
    #[serde(default)]
    pub name: Option<String>,
    /// Transport protocol
    pub protocol: PortProtocol,
    /// Service port
    pub port: u16,
    /// Port opened on every node (0 when not allocated)
    #[serde(default)]
    pub node_port: u16,
}

impl ServicePort {
    /// Create a port with an allocated node port
    pub fn new(protocol: PortProtocol, port: u16, node_port: u16) -> Self {
        Self {
            name: None,
            protocol,
            port,
            node_port,
        }
    }
}

/// Snapshot of a cluster service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Namespace
    pub namespace: String,
    /// Service name
    pub name: String,
    /// Revision marker
    pub resource_version: String,
    /// Exposure type
    #[serde(default)]
    pub service_type: ServiceType,
    /// Declared ports
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl Service {
    /// Create a service without ports
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        resource_version: impl Into<String>,
        service_type: ServiceType,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            resource_version: resource_version.into(),
            service_type,
            ports: Vec::new(),
        }
    }

    /// Add a declared port
    pub fn with_port(mut self, port: ServicePort) -> Self {
        self.ports.push(port);
        self
    }

    /// Whether the service is reachable from outside the cluster
    pub fn is_externally_reachable(&self) -> bool {
        matches!(
            self.service_type,
            ServiceType::LoadBalancer | ServiceType::NodePort
        )
    }
}

impl Member for Service {
    fn key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }
}

/// Raw event delivered by a membership feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent<T> {
    /// Full listing: initial bootstrap, or a relist after the watch desynced
    Listed(Vec<T>),
    /// Object created or modified
    Applied(T),
    /// Object removed (carries the last known snapshot)
    Deleted(T),
}

/// Trait for membership feed implementations
///
/// The returned stream must start with a [`SourceEvent::Listed`] bootstrap
/// and then deliver changes in order, each carrying the full snapshot.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
pub trait MembershipSource<T>: Send + Sync {
    /// Start watching for membership changes
    ///
    /// This should be called only once per source.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = SourceEvent<T>> + Send + 'static>>;

    /// Name of the feed (for logging/debugging)
    fn source_name(&self) -> &'static str;
}

/// Membership update API used to write labels back onto nodes
///
/// A label written here is only visible to synchronizers once the feed
/// delivers the updated node.
#[async_trait]
pub trait NodeLabeler: Send + Sync {
    /// Set `key=value` on the named node
    async fn set_label(&self, node: &str, key: &str, value: &str) -> Result<(), crate::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_ipv4_external_address_wins() {
        let node = Node::new("n1", "1")
            .with_address(NodeAddressType::InternalIp, "10.1.0.4")
            .with_address(NodeAddressType::ExternalIp, "2001:db8::1")
            .with_address(NodeAddressType::ExternalIp, "51.15.0.1")
            .with_address(NodeAddressType::ExternalIp, "51.15.0.2");

        assert_eq!(
            node.preferred_external_ip(),
            Some("51.15.0.1".parse().unwrap())
        );
    }

    #[test]
    fn ipv6_only_falls_back_to_last_seen() {
        let node = Node::new("n1", "1")
            .with_address(NodeAddressType::ExternalIp, "2001:db8::1")
            .with_address(NodeAddressType::ExternalIp, "2001:db8::2");

        assert_eq!(
            node.preferred_external_ip(),
            Some("2001:db8::2".parse().unwrap())
        );
    }

    #[test]
    fn no_external_address() {
        let node = Node::new("n1", "1").with_address(NodeAddressType::InternalIp, "10.0.0.1");
        assert_eq!(node.preferred_external_ip(), None);
    }

    #[test]
    fn service_key_includes_namespace() {
        let svc = Service::new("default", "web", "7", ServiceType::NodePort);
        assert_eq!(svc.key(), "default/web");
        assert!(svc.is_externally_reachable());

        let internal = Service::new("default", "db", "7", ServiceType::ClusterIp);
        assert!(!internal.is_externally_reachable());
    }
}
