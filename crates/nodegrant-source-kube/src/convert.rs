//! Conversion of Kubernetes objects into membership snapshots

use k8s_openapi::api::core::v1::{Node as K8sNode, Service as K8sService};
use nodegrant_core::traits::{
    Node, NodeAddressType, PortProtocol, Service, ServicePort, ServiceType,
};
use tracing::debug;

/// Convert a Kubernetes node, or `None` when it carries no name
pub fn node_from_k8s(node: K8sNode) -> Option<Node> {
    let meta = node.metadata;
    let name = meta.name?;

    let addresses: Vec<_> = node
        .status
        .and_then(|s| s.addresses)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|a| match address_type(&a.type_) {
            Some(kind) => Some((kind, a.address)),
            None => {
                debug!("Ignoring address {} of unknown type {} on {}", a.address, a.type_, name);
                None
            }
        })
        .collect();

    let mut converted = Node::new(name, meta.resource_version.unwrap_or_default());
    converted.labels = meta.labels.unwrap_or_default();
    for (kind, address) in addresses {
        converted = converted.with_address(kind, address);
    }
    Some(converted)
}

fn address_type(raw: &str) -> Option<NodeAddressType> {
    match raw {
        "Hostname" => Some(NodeAddressType::Hostname),
        "ExternalIP" => Some(NodeAddressType::ExternalIp),
        "InternalIP" => Some(NodeAddressType::InternalIp),
        "ExternalDNS" => Some(NodeAddressType::ExternalDns),
        "InternalDNS" => Some(NodeAddressType::InternalDns),
        _ => None,
    }
}

/// Convert a Kubernetes service, or `None` when it carries no name
pub fn service_from_k8s(service: K8sService) -> Option<Service> {
    let meta = service.metadata;
    let name = meta.name?;
    let spec = service.spec.unwrap_or_default();

    let service_type = match spec.type_.as_deref() {
        None | Some("ClusterIP") => ServiceType::ClusterIp,
        Some("NodePort") => ServiceType::NodePort,
        Some("LoadBalancer") => ServiceType::LoadBalancer,
        Some("ExternalName") => ServiceType::ExternalName,
        Some(other) => {
            debug!("Service {} has unknown type {}, treating as ClusterIP", name, other);
            ServiceType::ClusterIp
        }
    };

    let mut converted = Service::new(
        meta.namespace.unwrap_or_default(),
        name,
        meta.resource_version.unwrap_or_default(),
        service_type,
    );

    for port in spec.ports.unwrap_or_default() {
        let protocol = match port.protocol.as_deref() {
            None | Some("TCP") => PortProtocol::Tcp,
            Some("UDP") => PortProtocol::Udp,
            Some("SCTP") => PortProtocol::Sctp,
            Some(other) => {
                debug!("Ignoring port {} with unknown protocol {}", port.port, other);
                continue;
            }
        };
        let (Ok(number), Ok(node_port)) = (
            u16::try_from(port.port),
            u16::try_from(port.node_port.unwrap_or(0)),
        ) else {
            debug!("Ignoring out-of-range port {} on {}", port.port, converted.name);
            continue;
        };

        let mut converted_port = ServicePort::new(protocol, number, node_port);
        converted_port.name = port.name;
        converted = converted.with_port(converted_port);
    }

    Some(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        NodeAddress as K8sNodeAddress, NodeStatus, ServicePort as K8sServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn k8s_node(name: &str) -> K8sNode {
        K8sNode {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("42".to_string()),
                labels: Some(BTreeMap::from([(
                    "reserved-ip".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![
                    K8sNodeAddress {
                        type_: "InternalIP".to_string(),
                        address: "10.68.0.5".to_string(),
                    },
                    K8sNodeAddress {
                        type_: "ExternalIP".to_string(),
                        address: "51.15.0.1".to_string(),
                    },
                    K8sNodeAddress {
                        type_: "Bogus".to_string(),
                        address: "x".to_string(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn converts_node() {
        let node = node_from_k8s(k8s_node("pool-1")).unwrap();
        assert_eq!(node.name, "pool-1");
        assert_eq!(node.resource_version, "42");
        assert!(node.has_label("reserved-ip", "true"));
        assert_eq!(node.addresses.len(), 2);
        assert_eq!(
            node.preferred_external_ip(),
            Some("51.15.0.1".parse().unwrap())
        );
    }

    #[test]
    fn unnamed_node_is_skipped() {
        assert!(node_from_k8s(K8sNode::default()).is_none());
    }

    #[test]
    fn converts_node_port_service() {
        let service = K8sService {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                ports: Some(vec![
                    K8sServicePort {
                        port: 80,
                        node_port: Some(30080),
                        protocol: None,
                        ..Default::default()
                    },
                    K8sServicePort {
                        name: Some("dns".to_string()),
                        port: 53,
                        node_port: Some(30053),
                        protocol: Some("UDP".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let service = service_from_k8s(service).unwrap();
        assert_eq!(service.service_type, ServiceType::NodePort);
        assert_eq!(service.ports.len(), 2);
        assert_eq!(service.ports[0].protocol, PortProtocol::Tcp);
        assert_eq!(service.ports[1].node_port, 30053);
        assert_eq!(service.ports[1].name.as_deref(), Some("dns"));
    }

    #[test]
    fn service_without_spec_is_cluster_internal() {
        let service = K8sService {
            metadata: ObjectMeta {
                name: Some("db".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let service = service_from_k8s(service).unwrap();
        assert_eq!(service.service_type, ServiceType::ClusterIp);
        assert!(service.ports.is_empty());
    }
}
