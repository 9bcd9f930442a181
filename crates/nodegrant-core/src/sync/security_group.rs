//! Security-group rules
//!
//! Two synchronizers share the configured groups:
//!
//! - [`NodeSecurityGroupSync`] opens every group to the private and public
//!   addresses of each node, and closes it again when the node goes away.
//! - [`ServiceSecurityGroupSync`] opens the node ports of every externally
//!   reachable service to the world. Rules are never removed.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::Synchronizer;
use crate::error::{Error, Result};
use crate::traits::{
    Node, PortProtocol, QualifiedId, ResourceApi, RuleProtocol, RuleSpec, SecurityGroupRule,
    Service,
};

fn parse_groups(raw: &[String]) -> Vec<(String, Option<QualifiedId>)> {
    raw.iter()
        .map(|group| (group.clone(), QualifiedId::parse(group).ok()))
        .collect()
}

fn retry_error(api: &dyn ResourceApi, key: &str) -> Error {
    Error::provider(
        api.provider_name(),
        format!("could not update every security group for {}", key),
    )
}

/// Allows node addresses in the configured security groups
pub struct NodeSecurityGroupSync {
    api: Arc<dyn ResourceApi>,
    groups: Vec<(String, Option<QualifiedId>)>,
}

impl NodeSecurityGroupSync {
    /// Create the synchronizer; an empty list disables it
    pub fn new(api: Arc<dyn ResourceApi>, security_group_ids: &[String]) -> Self {
        Self {
            api,
            groups: parse_groups(security_group_ids),
        }
    }

    /// Returns true when a call failed
    async fn sync_group(
        &self,
        zone: &str,
        group: &QualifiedId,
        key: &str,
        present: bool,
        addresses: &[IpAddr],
    ) -> bool {
        let rules = match self.api.list_security_group_rules(Some(zone), &group.id).await {
            Ok(rules) => rules,
            Err(e) => {
                error!("Could not list rules of security group {}: {}", group, e);
                return true;
            }
        };

        let matching: Vec<&SecurityGroupRule> = rules
            .iter()
            .filter(|rule| addresses.contains(&rule.spec.ip_range.addr()))
            .collect();

        let mut failed = false;

        if !present {
            for rule in matching {
                match self
                    .api
                    .delete_security_group_rule(Some(zone), &group.id, &rule.id)
                    .await
                {
                    Ok(()) => info!("Deleted rule {} of node {} in security group {}", rule.spec.ip_range, key, group),
                    Err(e) => {
                        error!("Could not delete rule {} in security group {}: {}", rule.id, group, e);
                        failed = true;
                    }
                }
            }
            return failed;
        }

        for address in addresses {
            if matching.iter().any(|rule| rule.spec.ip_range.addr() == *address) {
                continue;
            }
            let spec = RuleSpec::accept_host(*address);
            match self
                .api
                .create_security_group_rule(Some(zone), &group.id, &spec)
                .await
            {
                Ok(()) => info!("Allowed {} of node {} in security group {}", address, key, group),
                Err(e) => {
                    error!("Could not allow {} in security group {}: {}", address, group, e);
                    failed = true;
                }
            }
        }

        failed
    }
}

#[async_trait]
impl Synchronizer<Node> for NodeSecurityGroupSync {
    fn name(&self) -> &'static str {
        "node-security-group"
    }

    fn is_enabled(&self) -> bool {
        !self.groups.is_empty()
    }

    async fn sync(&self, key: &str, member: Option<&Node>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let server = match self.api.find_server(key).await {
            Ok(server) => server,
            Err(e) if member.is_none() => {
                warn!("Instance of deleted node {} is gone, nothing to clean: {}", key, e);
                return Ok(());
            }
            Err(e) => {
                error!("Could not get instance {}: {}", key, e);
                return Err(e);
            }
        };

        let mut addresses: Vec<IpAddr> = server
            .private_ip
            .into_iter()
            .chain(server.public_ip.as_ref().map(|ip| ip.address))
            .collect();
        addresses.dedup();

        let mut failed = false;
        for (raw, id) in &self.groups {
            let Some(group) = id else {
                error!("Skipping malformed security group {}", raw);
                continue;
            };
            if group.location().is_some_and(|zone| zone != server.zone) {
                warn!(
                    "Ignoring security group {} for node {} in zone {}",
                    group, key, server.zone
                );
                continue;
            }
            failed |= self
                .sync_group(&server.zone, group, key, member.is_some(), &addresses)
                .await;
        }

        if failed {
            return Err(retry_error(self.api.as_ref(), key));
        }
        Ok(())
    }
}

/// Opens the node ports of externally reachable services
pub struct ServiceSecurityGroupSync {
    api: Arc<dyn ResourceApi>,
    groups: Vec<(String, Option<QualifiedId>)>,
}

impl ServiceSecurityGroupSync {
    /// Create the synchronizer; an empty list disables it
    pub fn new(api: Arc<dyn ResourceApi>, security_group_ids: &[String]) -> Self {
        Self {
            api,
            groups: parse_groups(security_group_ids),
        }
    }

    /// Ports to open: (protocol, node port) of every allocated node port
    fn wanted_ports(service: &Service) -> Vec<(RuleProtocol, u16)> {
        service
            .ports
            .iter()
            .filter(|port| port.node_port != 0)
            .filter_map(|port| match port.protocol {
                PortProtocol::Tcp => Some((RuleProtocol::Tcp, port.node_port)),
                PortProtocol::Udp => Some((RuleProtocol::Udp, port.node_port)),
                PortProtocol::Sctp => {
                    warn!(
                        "Cannot open {} port {} in security groups",
                        port.protocol.as_str(),
                        port.node_port
                    );
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Synchronizer<Service> for ServiceSecurityGroupSync {
    fn name(&self) -> &'static str {
        "service-security-group"
    }

    fn is_enabled(&self) -> bool {
        !self.groups.is_empty()
    }

    async fn sync(&self, key: &str, member: Option<&Service>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let Some(service) = member else {
            info!("Service {} does not exist anymore, ignoring", key);
            return Ok(());
        };

        if !service.is_externally_reachable() {
            info!("Service {} is not externally reachable, ignoring", key);
            return Ok(());
        }

        let ports = Self::wanted_ports(service);
        let mut failed = false;

        for (raw, id) in &self.groups {
            let Some(group) = id else {
                error!("Skipping malformed security group {}", raw);
                continue;
            };

            let rules = match self
                .api
                .list_security_group_rules(group.location(), &group.id)
                .await
            {
                Ok(rules) => rules,
                Err(e) => {
                    error!("Could not list rules of security group {}: {}", group, e);
                    failed = true;
                    continue;
                }
            };

            for (protocol, port) in &ports {
                if rules
                    .iter()
                    .any(|rule| rule.spec.allows_exact_port(*protocol, *port))
                {
                    continue;
                }
                let spec = RuleSpec::accept_port(*protocol, *port);
                match self
                    .api
                    .create_security_group_rule(group.location(), &group.id, &spec)
                    .await
                {
                    Ok(()) => info!(
                        "Opened {} port {} for service {} in security group {}",
                        protocol.as_str(),
                        port,
                        key,
                        group
                    ),
                    Err(e) => {
                        error!(
                            "Could not open {} port {} in security group {}: {}",
                            protocol.as_str(),
                            port,
                            group,
                            e
                        );
                        failed = true;
                    }
                }
            }
        }

        if failed {
            return Err(retry_error(self.api.as_ref(), key));
        }
        Ok(())
    }
}
