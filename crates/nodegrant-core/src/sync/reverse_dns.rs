//! Reverse DNS for node addresses
//!
//! For every node with a fixed public IPv4 address, an `A` record named
//! after the reversed address is created in the reverse zone, and the
//! address's reverse pointer is set to that name. Records are found again
//! through their comment, which holds the node key.
//!
//! When the zone is not hosted on the platform's DNS (its listing answers
//! not found or forbidden), the record steps are skipped and only the
//! reverse pointer is maintained.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::Synchronizer;
use crate::config::DnsConfig;
use crate::error::{Error, Result};
use crate::traits::{DnsRecord, Node, ResourceApi};

const RECORD_TYPE: &str = "A";

/// Record name for an address: octets reversed and joined with `-`
///
/// `51.15.1.2` becomes `2-1-15-51`.
pub fn reverse_label(address: Ipv4Addr) -> String {
    let [a, b, c, d] = address.octets();
    format!("{}-{}-{}-{}", d, c, b, a)
}

/// Maintains forward records and reverse pointers of node addresses
pub struct ReverseDnsSync {
    api: Arc<dyn ResourceApi>,
    domain: Option<String>,
    ttl: u32,
    page_size: u32,
    propagation_delay: Duration,
}

impl ReverseDnsSync {
    /// Create the synchronizer; `None` (or an empty domain) disables it
    pub fn new(api: Arc<dyn ResourceApi>, domain: Option<String>, config: &DnsConfig) -> Self {
        Self {
            api,
            domain: domain.filter(|d| !d.trim().is_empty()),
            ttl: config.record_ttl,
            page_size: config.page_size,
            propagation_delay: config.propagation_delay(),
        }
    }

    /// Every `A` record of the zone, all pages drained
    ///
    /// `None` when the zone is not hosted here.
    async fn list_records(&self, zone: &str) -> Result<Option<Vec<DnsRecord>>> {
        let mut records = Vec::new();
        let mut page = 1;
        loop {
            let batch = match self
                .api
                .list_dns_records(zone, RECORD_TYPE, page, self.page_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) if page == 1 && zone_not_hosted(&e) => {
                    debug!("Zone {} is not hosted here: {}", zone, e);
                    return Ok(None);
                }
                Err(e) => {
                    error!("Could not list records of zone {}: {}", zone, e);
                    return Err(e);
                }
            };
            let short = batch.len() < self.page_size as usize;
            records.extend(batch);
            if short {
                return Ok(Some(records));
            }
            page += 1;
        }
    }

    async fn remove(&self, zone: &str, key: &str) -> Result<()> {
        let Some(records) = self.list_records(zone).await? else {
            return Ok(());
        };

        for record in records.iter().filter(|r| r.comment.as_deref() == Some(key)) {
            self.api
                .delete_dns_record(zone, &record.id)
                .await
                .inspect_err(|e| {
                    error!("Could not delete record {} for node {}: {}", record.name, key, e);
                })?;
            info!("Deleted record {} for node {}", record.name, key);

            // the address may already belong to someone else
            match record.data.parse::<IpAddr>() {
                Ok(address) => {
                    if let Err(e) = self.api.set_ip_reverse(address, None).await {
                        warn!("Could not clear reverse of {}: {}", address, e);
                    }
                }
                Err(_) => debug!("Record {} does not hold an address", record.name),
            }
        }

        Ok(())
    }

    async fn ensure(&self, zone: &str, key: &str, address: Ipv4Addr) -> Result<()> {
        let label = reverse_label(address);
        let data = address.to_string();
        let reverse = format!("{}.{}", label, zone);

        match self.list_records(zone).await? {
            Some(records) => self.ensure_record(zone, key, &label, &data, &records).await?,
            None => info!("Zone {} is hosted elsewhere, only setting the reverse of {}", zone, address),
        }

        let ips = self.api.list_ips().await.inspect_err(|e| {
            error!("Could not list IPs for node {}: {}", key, e);
        })?;
        let current = ips
            .iter()
            .find(|ip| ip.address == IpAddr::V4(address))
            .and_then(|ip| ip.reverse.as_deref());
        if current == Some(reverse.as_str()) {
            return Ok(());
        }

        self.api
            .set_ip_reverse(IpAddr::V4(address), Some(&reverse))
            .await
            .inspect_err(|e| {
                error!("Could not set reverse of {} to {}: {}", address, reverse, e);
            })?;
        info!("Set reverse of {} to {}", address, reverse);

        Ok(())
    }

    /// Keep exactly one tagged record `label -> data`, dropping the others
    async fn ensure_record(
        &self,
        zone: &str,
        key: &str,
        label: &str,
        data: &str,
        records: &[DnsRecord],
    ) -> Result<()> {
        let mut up_to_date = false;
        for record in records.iter().filter(|r| r.comment.as_deref() == Some(key)) {
            if record.name == label && record.data == data && !up_to_date {
                up_to_date = true;
                continue;
            }
            self.api
                .delete_dns_record(zone, &record.id)
                .await
                .inspect_err(|e| {
                    error!("Could not delete stale record {} for node {}: {}", record.name, key, e);
                })?;
            info!("Deleted stale record {} for node {}", record.name, key);
        }

        if !up_to_date {
            let record = DnsRecord {
                id: String::new(),
                name: label.to_string(),
                data: data.to_string(),
                record_type: RECORD_TYPE.to_string(),
                ttl: self.ttl,
                comment: Some(key.to_string()),
            };
            self.api
                .add_dns_record(zone, &record)
                .await
                .inspect_err(|e| {
                    error!("Could not add record {} for node {}: {}", label, key, e);
                })?;
            info!("Added record {}.{} -> {} for node {}", label, zone, data, key);

            // the platform checks the forward record before accepting a reverse
            tokio::time::sleep(self.propagation_delay).await;
        }

        Ok(())
    }
}

/// Whether a listing error means the zone does not live on this platform
fn zone_not_hosted(err: &Error) -> bool {
    matches!(err, Error::NotFound(_) | Error::Authentication(_))
}

#[async_trait]
impl Synchronizer<Node> for ReverseDnsSync {
    fn name(&self) -> &'static str {
        "reverse-dns"
    }

    fn is_enabled(&self) -> bool {
        self.domain.is_some()
    }

    async fn sync(&self, key: &str, member: Option<&Node>) -> Result<()> {
        let Some(zone) = self.domain.as_deref() else {
            return Ok(());
        };

        if member.is_none() {
            info!("Node {} was deleted, removing its reverse record", key);
            return self.remove(zone, key).await;
        }

        let server = self.api.find_server(key).await.inspect_err(|e| {
            error!("Could not get instance {}: {}", key, e);
        })?;

        let Some(public_ip) = server.public_ip.as_ref() else {
            warn!("Node {} does not have a public IP", key);
            return Ok(());
        };

        if public_ip.dynamic {
            debug!("Node {} has a dynamic IP, skipping reverse", key);
            return Ok(());
        }

        let IpAddr::V4(address) = public_ip.address else {
            warn!("Node {} has a non IPv4 public address {}, skipping reverse", key, public_ip.address);
            return Ok(());
        };

        self.ensure(zone, key, address).await
    }
}
