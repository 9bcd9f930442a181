//! Data-store allow-lists
//!
//! Keeps one allow-list entry per node on every configured relational
//! database and cache cluster. Entries are linked to nodes through their
//! description, which holds the node key.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{Synchronizer, host_net};
use crate::config::AddressSource;
use crate::error::{Error, Result};
use crate::traits::{DataStoreInstance, DataStoreKind, Node, QualifiedId, ResourceApi};

/// Maintains data-store allow-list entries for nodes
pub struct DataStoreAclSync {
    api: Arc<dyn ResourceApi>,
    targets: Vec<(DataStoreKind, String)>,
    address_source: AddressSource,
}

impl DataStoreAclSync {
    /// Create the synchronizer; empty lists disable it
    pub fn new(
        api: Arc<dyn ResourceApi>,
        database_ids: &[String],
        redis_ids: &[String],
        address_source: AddressSource,
    ) -> Self {
        let targets = database_ids
            .iter()
            .map(|id| (DataStoreKind::Relational, id.clone()))
            .chain(redis_ids.iter().map(|id| (DataStoreKind::Cache, id.clone())))
            .collect();

        Self {
            api,
            targets,
            address_source,
        }
    }

    async fn node_address(&self, key: &str, node: &Node) -> Option<IpAddr> {
        match self.address_source {
            AddressSource::Kubernetes => {
                let address = node.preferred_external_ip();
                if address.is_none() {
                    warn!("Node {} does not report an external IP", key);
                }
                address
            }
            AddressSource::Instance => match self.api.find_server(key).await {
                Ok(server) => {
                    let address = server.public_ip.map(|ip| ip.address);
                    if address.is_none() {
                        warn!("Node {} does not have a public IP", key);
                    }
                    address
                }
                Err(e) => {
                    error!("Could not get instance {}: {}", key, e);
                    None
                }
            },
        }
    }

    /// Returns true when a mutation failed
    async fn sync_instance(
        &self,
        instance: &DataStoreInstance,
        key: &str,
        address: Option<IpAddr>,
    ) -> bool {
        let rules = match self.api.list_acl_rules(instance).await {
            Ok(rules) => rules,
            Err(e) => {
                error!("Could not list ACLs of {} {}: {}", instance.kind, instance.id, e);
                return false;
            }
        };

        let wanted = address.map(host_net);
        let mut failed = false;
        let mut present = false;

        for rule in rules.iter().filter(|r| r.description == key) {
            if Some(rule.ip) == wanted && !present {
                present = true;
                continue;
            }
            match self.api.delete_acl_rule(instance, rule).await {
                Ok(()) => info!("Deleted ACL {} of node {} on {} {}", rule.ip, key, instance.kind, instance.id),
                Err(e) => {
                    error!("Could not delete ACL {} on {} {}: {}", rule.ip, instance.kind, instance.id, e);
                    failed = true;
                }
            }
        }

        if let Some(ip) = wanted.filter(|_| !present) {
            match self.api.add_acl_rule(instance, ip, key).await {
                Ok(()) => info!("Added ACL {} for node {} on {} {}", ip, key, instance.kind, instance.id),
                Err(e) => {
                    error!("Could not add ACL {} on {} {}: {}", ip, instance.kind, instance.id, e);
                    failed = true;
                }
            }
        }

        failed
    }
}

#[async_trait]
impl Synchronizer<Node> for DataStoreAclSync {
    fn name(&self) -> &'static str {
        "datastore-acl"
    }

    fn is_enabled(&self) -> bool {
        !self.targets.is_empty()
    }

    async fn sync(&self, key: &str, member: Option<&Node>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let address = match member {
            Some(node) => match self.node_address(key, node).await {
                Some(address) => Some(address),
                // nothing to allow, and no reason to drop existing entries
                None => return Ok(()),
            },
            None => None,
        };

        let mut retry = false;
        for (kind, raw) in &self.targets {
            debug!("Syncing {} {} ACLs for node {}", kind, raw, key);

            let id = match QualifiedId::parse(raw) {
                Ok(id) => id,
                Err(e) => {
                    error!("Skipping {} {}: {}", kind, raw, e);
                    continue;
                }
            };

            let instance = match self.api.get_data_store(*kind, &id).await {
                Ok(instance) => instance,
                Err(e) => {
                    error!("Could not get {} {}: {}", kind, id, e);
                    continue;
                }
            };

            retry |= self.sync_instance(&instance, key, address).await;
        }

        if retry {
            return Err(Error::provider(
                self.api.provider_name(),
                format!("could not update every data-store ACL for {}", key),
            ));
        }
        Ok(())
    }
}
