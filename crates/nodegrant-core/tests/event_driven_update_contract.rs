//! Architectural Contract Test: Event-Driven Reconciliation
//!
//! Passes are triggered by membership events only, through the event
//! translators.
//!
//! Scenarios verified:
//! - A new node with a dynamic address receives a reserved IP and the label
//! - A node-port service gets its ports opened in the security groups
//! - A load-balancer service adds only its missing rule, leaving others alone
//! - A cluster-internal service causes no API call
//! - A node update that does not change addresses causes no pass

mod common;

use common::*;
use nodegrant_core::ControllerEvent;
use nodegrant_core::traits::{
    PortProtocol, ResourceApi, RuleProtocol, RuleSpec, Service, ServicePort, ServiceType,
    SourceEvent,
};
use std::time::Duration;

#[tokio::test]
async fn new_node_receives_reserved_ip_and_label() {
    let mut config = minimal_config();
    config.reserved_ips = vec!["51.15.9.9".to_string(), "51.15.9.10".to_string()];
    let cloud = FakeCloud::new();
    cloud.add_server("n1", Some(("51.15.0.1", true)), None);
    cloud.add_ip("51.15.9.9");
    cloud.add_ip("198.51.100.1");

    let mut harness = Harness::start(config, cloud.clone());
    harness.nodes.send(SourceEvent::Listed(Vec::new())).unwrap();
    harness.services.send(SourceEvent::Listed(Vec::new())).unwrap();
    harness
        .nodes
        .send(SourceEvent::Applied(node("n1", "1", "51.15.0.1")))
        .unwrap();

    harness
        .wait_for_event(|e| matches!(e, ControllerEvent::PassSucceeded { key, .. } if key == "n1"))
        .await;

    let attached: Vec<String> = cloud
        .ips()
        .into_iter()
        .filter(|ip| ip.server_id.as_deref() == Some("srv-n1"))
        .map(|ip| ip.address.to_string())
        .collect();
    assert_eq!(attached, vec!["51.15.9.9"], "only pool addresses are used");
    assert_eq!(
        harness.labeler.calls(),
        vec![("n1".to_string(), "reserved-ip".to_string(), "true".to_string())]
    );

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn node_port_service_opens_its_ports() {
    let mut config = minimal_config();
    config.security_group_ids = vec!["fr-par-1/sg-1".to_string(), "sg-2".to_string()];
    let cloud = FakeCloud::new();
    cloud.add_security_group("sg-1");
    cloud.add_security_group("sg-2");

    let mut harness = Harness::start(config, cloud.clone());
    harness.nodes.send(SourceEvent::Listed(Vec::new())).unwrap();
    harness
        .services
        .send(SourceEvent::Listed(vec![
            Service::new("default", "web", "1", ServiceType::NodePort)
                .with_port(ServicePort::new(PortProtocol::Tcp, 80, 30080))
                .with_port(ServicePort::new(PortProtocol::Udp, 53, 30053)),
        ]))
        .unwrap();

    harness
        .wait_for_event(|e| matches!(e, ControllerEvent::PassSucceeded { key, .. } if key == "default/web"))
        .await;

    for group in ["sg-1", "sg-2"] {
        let rules = cloud.group_rules(group);
        assert_eq!(rules.len(), 2, "{} has both ports", group);
        assert!(rules.iter().any(|r| r.spec.allows_exact_port(RuleProtocol::Tcp, 30080)));
        assert!(rules.iter().any(|r| r.spec.allows_exact_port(RuleProtocol::Udp, 30053)));
        assert!(rules.iter().all(|r| r.spec.ip_range.to_string() == "0.0.0.0/0"));
    }

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn load_balancer_service_leaves_unrelated_rules() {
    let mut config = minimal_config();
    config.security_group_ids = vec!["sg-1".to_string()];
    let cloud = FakeCloud::new();
    cloud.add_security_group("sg-1");
    let ssh = RuleSpec::accept_port(RuleProtocol::Tcp, 22);
    let host = RuleSpec::accept_host("51.15.0.1".parse().unwrap());
    cloud.create_security_group_rule(None, "sg-1", &ssh).await.unwrap();
    cloud.create_security_group_rule(None, "sg-1", &host).await.unwrap();
    let before = cloud.group_rules("sg-1");

    let mut harness = Harness::start(config, cloud.clone());
    harness.nodes.send(SourceEvent::Listed(Vec::new())).unwrap();
    harness
        .services
        .send(SourceEvent::Listed(vec![
            Service::new("default", "svc1", "1", ServiceType::LoadBalancer)
                .with_port(ServicePort::new(PortProtocol::Tcp, 443, 30080)),
        ]))
        .unwrap();
    harness
        .wait_for_event(|e| matches!(e, ControllerEvent::PassSucceeded { key, .. } if key == "default/svc1"))
        .await;

    let after = cloud.group_rules("sg-1");
    assert_eq!(after.len(), 3);
    for rule in &before {
        assert!(after.contains(rule), "existing rule {} untouched", rule.id);
    }
    let created: Vec<_> = after
        .iter()
        .filter(|r| r.spec.allows_exact_port(RuleProtocol::Tcp, 30080))
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(cloud.call_count("create_security_group_rule"), 3);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn cluster_internal_service_is_ignored() {
    let mut config = minimal_config();
    config.security_group_ids = vec!["sg-1".to_string()];
    let cloud = FakeCloud::new();
    cloud.add_security_group("sg-1");

    let harness = Harness::start(config, cloud.clone());
    harness.nodes.send(SourceEvent::Listed(Vec::new())).unwrap();
    harness
        .services
        .send(SourceEvent::Listed(vec![
            Service::new("default", "db", "1", ServiceType::ClusterIp)
                .with_port(ServicePort::new(PortProtocol::Tcp, 5432, 0)),
        ]))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cloud.total_calls(), 0);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn node_update_without_address_change_is_ignored() {
    let mut config = minimal_config();
    config.security_group_ids = vec!["sg-1".to_string()];
    let cloud = FakeCloud::new();
    cloud.add_server("n1", Some(("51.15.0.1", false)), Some("10.0.0.10"));
    cloud.add_security_group("sg-1");

    let mut harness = Harness::start(config, cloud.clone());
    harness.services.send(SourceEvent::Listed(Vec::new())).unwrap();
    harness
        .nodes
        .send(SourceEvent::Listed(vec![node("n1", "1", "51.15.0.1")]))
        .unwrap();
    harness
        .wait_for_event(|e| matches!(e, ControllerEvent::PassSucceeded { .. }))
        .await;
    let calls = cloud.total_calls();

    harness
        .nodes
        .send(SourceEvent::Applied(
            node("n1", "2", "51.15.0.1").with_label("team", "infra"),
        ))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cloud.total_calls(), calls, "label change alone is ignored");

    harness
        .nodes
        .send(SourceEvent::Applied(node("n1", "3", "51.15.0.2")))
        .unwrap();
    harness
        .wait_for_event(|e| matches!(e, ControllerEvent::PassSucceeded { .. }))
        .await;
    assert!(cloud.total_calls() > calls, "address change triggers a pass");

    harness.stop().await.unwrap();
}
