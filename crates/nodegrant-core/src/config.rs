//! Configuration types for the nodegrant system
//!
//! This module defines all configuration structures used throughout the crate.
//! An empty list (or an absent domain) disables the matching synchronizer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Domain used for reverse pointers (also the DNS zone holding the records)
    #[serde(default)]
    pub reverse_ip_domain: Option<String>,

    /// Relational database instances, each `id` or `region/id`
    #[serde(default)]
    pub database_ids: Vec<String>,

    /// Cache clusters, each `id` or `zone/id`
    #[serde(default)]
    pub redis_ids: Vec<String>,

    /// Reserved IP pool (literal addresses)
    #[serde(default)]
    pub reserved_ips: Vec<String>,

    /// Security groups, each `id` or `zone/id`
    #[serde(default)]
    pub security_group_ids: Vec<String>,

    /// Where node addresses for data-store allow-lists come from
    #[serde(default)]
    pub nodes_ip_source: AddressSource,

    /// Label set on nodes once they hold a fixed address
    #[serde(default = "default_reserved_ip_label")]
    pub reserved_ip_label: String,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Reverse DNS settings
    #[serde(default)]
    pub dns: DnsConfig,
}

impl ControllerConfig {
    /// Create a new configuration with defaults (every synchronizer disabled)
    pub fn new() -> Self {
        Self {
            reverse_ip_domain: None,
            database_ids: Vec::new(),
            redis_ids: Vec::new(),
            reserved_ips: Vec::new(),
            security_group_ids: Vec::new(),
            nodes_ip_source: AddressSource::default(),
            reserved_ip_label: default_reserved_ip_label(),
            engine: EngineConfig::default(),
            dns: DnsConfig::default(),
        }
    }

    /// Validate the configuration
    ///
    /// Malformed qualified identifiers are not rejected here: they are
    /// logged and skipped by the synchronizer that owns them.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self
            .reverse_ip_domain
            .as_deref()
            .is_some_and(|d| d.trim().is_empty())
        {
            return Err(crate::Error::config("Reverse IP domain cannot be empty"));
        }

        if self.reserved_ip_label.is_empty() {
            return Err(crate::Error::config("Reserved IP label cannot be empty"));
        }

        self.engine.validate()?;
        self.dns.validate()?;

        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of a node's address for data-store allow-lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    /// External address reported by the node itself
    Kubernetes,
    /// Public address of the backing compute instance
    #[default]
    Instance,
}

impl AddressSource {
    /// Parse the address-source policy; anything but `kubernetes` means instance
    pub fn from_setting(value: &str) -> Self {
        if value == "kubernetes" {
            AddressSource::Kubernetes
        } else {
            AddressSource::Instance
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of rate-limited requeues before a key is abandoned
    #[serde(default = "default_number_retries")]
    pub number_retries: u32,

    /// Worker tasks draining the node queue
    #[serde(default = "default_workers")]
    pub node_workers: usize,

    /// Worker tasks draining the service queue
    #[serde(default = "default_workers")]
    pub service_workers: usize,

    /// Delay before the first requeue of a failing key (in milliseconds)
    ///
    /// Doubles on every consecutive failure of the same key.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound of the requeue delay (in seconds)
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Capacity of the controller event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    /// Validate engine settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.node_workers == 0 || self.service_workers == 0 {
            return Err(crate::Error::config("Worker count must be > 0"));
        }
        if self.backoff_base_ms == 0 {
            return Err(crate::Error::config("Backoff base must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }

    /// Requeue delay after the first failure
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Requeue delay cap
    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            number_retries: default_number_retries(),
            node_workers: default_workers(),
            service_workers: default_workers(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Reverse DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Wait between creating the forward record and setting the reverse pointer
    #[serde(default = "default_propagation_delay_secs")]
    pub propagation_delay_secs: u64,

    /// TTL of created records
    #[serde(default = "default_record_ttl")]
    pub record_ttl: u32,

    /// Page size used when listing zone records
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl DnsConfig {
    /// Validate DNS settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.page_size == 0 {
            return Err(crate::Error::config("DNS page size must be > 0"));
        }
        Ok(())
    }

    /// Propagation wait as a duration
    pub fn propagation_delay(&self) -> Duration {
        Duration::from_secs(self.propagation_delay_secs)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            propagation_delay_secs: default_propagation_delay_secs(),
            record_ttl: default_record_ttl(),
            page_size: default_page_size(),
        }
    }
}

fn default_reserved_ip_label() -> String {
    "reserved-ip".to_string()
}

fn default_number_retries() -> u32 {
    30
}

fn default_workers() -> usize {
    1
}

fn default_backoff_base_ms() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    1000
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_propagation_delay_secs() -> u64 {
    30
}

fn default_record_ttl() -> u32 {
    600
}

fn default_page_size() -> u32 {
    1000
}
