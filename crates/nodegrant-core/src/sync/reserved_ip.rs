//! Reserved IP assignment
//!
//! Swaps the dynamic public address of a node's instance for a free address
//! of the reserved pool, then marks the node with a label.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::Synchronizer;
use crate::error::Result;
use crate::traits::{FloatingIp, Node, NodeLabeler, ResourceApi};

const LABEL_VALUE: &str = "true";

/// Attaches reserved IPs to nodes holding a dynamic address
pub struct ReservedIpSync {
    api: Arc<dyn ResourceApi>,
    labeler: Arc<dyn NodeLabeler>,
    pool: HashSet<IpAddr>,
    label: String,
}

impl ReservedIpSync {
    /// Create the synchronizer
    ///
    /// Pool entries that are not IP addresses are logged and ignored.
    pub fn new(
        api: Arc<dyn ResourceApi>,
        labeler: Arc<dyn NodeLabeler>,
        reserved_ips: &[String],
        label: impl Into<String>,
    ) -> Self {
        let pool = reserved_ips
            .iter()
            .filter_map(|raw| match raw.trim().parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(e) => {
                    error!("Ignoring invalid reserved IP {}: {}", raw, e);
                    None
                }
            })
            .collect();

        Self {
            api,
            labeler,
            pool,
            label: label.into(),
        }
    }

    fn pick_free<'a>(&self, ips: &'a [FloatingIp]) -> Option<&'a FloatingIp> {
        ips.iter()
            .find(|ip| !ip.is_attached() && self.pool.contains(&ip.address))
    }

    async fn ensure_label(&self, node: &Node) -> Result<()> {
        if node.has_label(&self.label, LABEL_VALUE) {
            return Ok(());
        }

        self.labeler
            .set_label(&node.name, &self.label, LABEL_VALUE)
            .await
            .inspect_err(|e| {
                error!("Could not add reserved IP label to node {}: {}", node.name, e)
            })
    }
}

#[async_trait]
impl Synchronizer<Node> for ReservedIpSync {
    fn name(&self) -> &'static str {
        "reserved-ip"
    }

    fn is_enabled(&self) -> bool {
        !self.pool.is_empty()
    }

    async fn sync(&self, key: &str, member: Option<&Node>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let Some(node) = member else {
            // the platform detaches the address when the instance goes away
            info!("Node {} was deleted, ignoring", key);
            return Ok(());
        };

        info!("Adding a reserved IP on node {}", key);

        let server = match self.api.find_server(key).await {
            Ok(server) => server,
            Err(e) if e.is_not_found() => {
                warn!("No instance found for node {}: {}", key, e);
                return Ok(());
            }
            Err(e) => {
                error!("Could not get instance {}: {}", key, e);
                return Err(e);
            }
        };

        let Some(public_ip) = server.public_ip.as_ref() else {
            warn!("Node {} does not have a public IP", key);
            return Ok(());
        };

        if !public_ip.dynamic {
            info!("Node {} already has a fixed public IP", key);
            return self.ensure_label(node).await;
        }

        let ips = self.api.list_ips().await.inspect_err(|e| {
            error!("Could not list IPs for node {}: {}", key, e);
        })?;

        let Some(free) = self.pick_free(&ips) else {
            warn!("No available reserved IPs for node {}", key);
            return Ok(());
        };

        self.api
            .attach_ip(&free.id, &server.id)
            .await
            .inspect_err(|e| {
                error!("Could not attach IP {} to node {}: {}", free.address, key, e);
            })?;
        info!("Attached reserved IP {} to node {}", free.address, key);

        self.ensure_label(node).await
    }
}
