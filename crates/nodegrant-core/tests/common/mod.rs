//! Test doubles and common utilities for contract tests
//!
//! `FakeCloud` is an in-memory `ResourceApi` that keeps enough state for
//! synchronizers to converge, counts mutations, and can fail selected
//! operations on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use ipnet::IpNet;
use nodegrant_core::config::{ControllerConfig, DnsConfig, EngineConfig};
use nodegrant_core::engine::{Controller, ControllerEvent, NodegrantEngine, node_synchronizers};
use nodegrant_core::error::{Error, Result};
use nodegrant_core::traits::{
    AclRule, DataStoreInstance, DataStoreKind, DnsRecord, FloatingIp, MembershipSource, Node,
    NodeAddressType, NodeLabeler, PublicIp, QualifiedId, ResourceApi, RuleSpec,
    SecurityGroupRule, Server, Service, SourceEvent,
};
use nodegrant_core::translator::NodeEvents;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::Stream;

pub const ZONE: &str = "fr-par-1";
pub const REGION: &str = "fr-par";
pub const REVERSE_DOMAIN: &str = "nodes.example.com";

#[derive(Default)]
struct CloudState {
    servers: HashMap<String, Server>,
    ips: Vec<FloatingIp>,
    records: HashMap<String, Vec<DnsRecord>>,
    acls: HashMap<(DataStoreKind, String), Vec<AclRule>>,
    groups: HashMap<String, Vec<SecurityGroupRule>>,
    next_id: usize,
}

impl CloudState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// In-memory resource API
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
    failing: Mutex<HashSet<&'static str>>,
    foreign_zones: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    mutations: AtomicUsize,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add an instance; `dynamic` describes its public address
    pub fn add_server(&self, name: &str, public: Option<(&str, bool)>, private: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        let public_ip = public.map(|(address, dynamic)| PublicIp {
            id: format!("ip-{}", name),
            address: address.parse().unwrap(),
            dynamic,
        });
        state.servers.insert(
            name.to_string(),
            Server {
                id: format!("srv-{}", name),
                name: name.to_string(),
                zone: ZONE.to_string(),
                public_ip,
                private_ip: private.map(|p| p.parse().unwrap()),
            },
        );
    }

    pub fn remove_server(&self, name: &str) {
        self.state.lock().unwrap().servers.remove(name);
    }

    /// Add a free floating IP
    pub fn add_ip(&self, address: &str) {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("fip");
        state.ips.push(FloatingIp {
            id,
            address: address.parse().unwrap(),
            reverse: None,
            server_id: None,
        });
    }

    pub fn add_data_store(&self, kind: DataStoreKind, id: &str) {
        self.state
            .lock()
            .unwrap()
            .acls
            .insert((kind, id.to_string()), Vec::new());
    }

    pub fn add_security_group(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert(id.to_string(), Vec::new());
    }

    pub fn server(&self, name: &str) -> Option<Server> {
        self.state.lock().unwrap().servers.get(name).cloned()
    }

    pub fn ips(&self) -> Vec<FloatingIp> {
        self.state.lock().unwrap().ips.clone()
    }

    pub fn records(&self, zone: &str) -> Vec<DnsRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(zone)
            .cloned()
            .unwrap_or_default()
    }

    pub fn acl_rules(&self, kind: DataStoreKind, id: &str) -> Vec<AclRule> {
        self.state
            .lock()
            .unwrap()
            .acls
            .get(&(kind, id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn group_rules(&self, id: &str) -> Vec<SecurityGroupRule> {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Seed a record without going through the API
    pub fn add_record(&self, zone: &str, name: &str, data: &str, comment: &str) {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("rec");
        state.records.entry(zone.to_string()).or_default().push(DnsRecord {
            id,
            name: name.to_string(),
            data: data.to_string(),
            record_type: "A".to_string(),
            ttl: 600,
            comment: Some(comment.to_string()),
        });
    }

    /// Answer record calls on `zone` as if it lived on another DNS provider
    pub fn host_zone_elsewhere(&self, zone: &str) {
        self.foreign_zones.lock().unwrap().insert(zone.to_string());
    }

    fn check_zone(&self, zone: &str) -> Result<()> {
        if self.foreign_zones.lock().unwrap().contains(zone) {
            return Err(Error::not_found(format!("dns zone {}", zone)));
        }
        Ok(())
    }

    /// Make every call of `operation` fail until `heal` is called
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
    }

    /// Number of state-changing calls so far
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of calls of `operation` so far
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn enter(&self, operation: &'static str, mutating: bool) -> Result<()> {
        self.calls.lock().unwrap().push(operation.to_string());
        if self.failing.lock().unwrap().contains(operation) {
            return Err(Error::provider("fake", format!("{} unavailable", operation)));
        }
        if mutating {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceApi for FakeCloud {
    async fn find_server(&self, name: &str) -> Result<Server> {
        self.enter("find_server", false)?;
        self.server(name)
            .ok_or_else(|| Error::not_found(format!("instance {}", name)))
    }

    async fn list_ips(&self) -> Result<Vec<FloatingIp>> {
        self.enter("list_ips", false)?;
        Ok(self.ips())
    }

    async fn attach_ip(&self, ip_id: &str, server_id: &str) -> Result<()> {
        self.enter("attach_ip", true)?;
        let mut state = self.state.lock().unwrap();
        let ip = state
            .ips
            .iter_mut()
            .find(|ip| ip.id == ip_id)
            .ok_or_else(|| Error::not_found(format!("ip {}", ip_id)))?;
        ip.server_id = Some(server_id.to_string());
        let public = PublicIp {
            id: ip.id.clone(),
            address: ip.address,
            dynamic: false,
        };
        if let Some(server) = state.servers.values_mut().find(|s| s.id == server_id) {
            server.public_ip = Some(public);
        }
        Ok(())
    }

    async fn set_ip_reverse(&self, address: IpAddr, reverse: Option<&str>) -> Result<()> {
        self.enter("set_ip_reverse", true)?;
        let mut state = self.state.lock().unwrap();
        if let Some(ip) = state.ips.iter_mut().find(|ip| ip.address == address) {
            ip.reverse = reverse.map(str::to_string);
        }
        Ok(())
    }

    async fn list_dns_records(
        &self,
        zone: &str,
        record_type: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<DnsRecord>> {
        self.enter("list_dns_records", false)?;
        self.check_zone(zone)?;
        let skip = (page.saturating_sub(1) * page_size) as usize;
        Ok(self
            .records(zone)
            .into_iter()
            .filter(|r| r.record_type == record_type)
            .skip(skip)
            .take(page_size as usize)
            .collect())
    }

    async fn add_dns_record(&self, zone: &str, record: &DnsRecord) -> Result<()> {
        self.enter("add_dns_record", true)?;
        self.check_zone(zone)?;
        let mut state = self.state.lock().unwrap();
        let mut record = record.clone();
        record.id = state.next_id("rec");
        state.records.entry(zone.to_string()).or_default().push(record);
        Ok(())
    }

    async fn delete_dns_record(&self, zone: &str, record_id: &str) -> Result<()> {
        self.enter("delete_dns_record", true)?;
        let mut state = self.state.lock().unwrap();
        if let Some(records) = state.records.get_mut(zone) {
            records.retain(|r| r.id != record_id);
        }
        Ok(())
    }

    async fn get_data_store(
        &self,
        kind: DataStoreKind,
        id: &QualifiedId,
    ) -> Result<DataStoreInstance> {
        self.enter("get_data_store", false)?;
        let state = self.state.lock().unwrap();
        if !state.acls.contains_key(&(kind, id.id.clone())) {
            return Err(Error::not_found(format!("{} {}", kind, id)));
        }
        let default = match kind {
            DataStoreKind::Relational => REGION,
            DataStoreKind::Cache => ZONE,
        };
        Ok(DataStoreInstance {
            id: id.id.clone(),
            location: id.location().unwrap_or(default).to_string(),
            kind,
        })
    }

    async fn list_acl_rules(&self, instance: &DataStoreInstance) -> Result<Vec<AclRule>> {
        self.enter("list_acl_rules", false)?;
        Ok(self.acl_rules(instance.kind, &instance.id))
    }

    async fn add_acl_rule(
        &self,
        instance: &DataStoreInstance,
        ip: IpNet,
        description: &str,
    ) -> Result<()> {
        self.enter("add_acl_rule", true)?;
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("acl");
        state
            .acls
            .entry((instance.kind, instance.id.clone()))
            .or_default()
            .push(AclRule {
                id: Some(id),
                ip,
                description: description.to_string(),
            });
        Ok(())
    }

    async fn delete_acl_rule(&self, instance: &DataStoreInstance, rule: &AclRule) -> Result<()> {
        self.enter("delete_acl_rule", true)?;
        let mut state = self.state.lock().unwrap();
        if let Some(rules) = state.acls.get_mut(&(instance.kind, instance.id.clone())) {
            rules.retain(|r| r.id != rule.id);
        }
        Ok(())
    }

    async fn list_security_group_rules(
        &self,
        _zone: Option<&str>,
        group_id: &str,
    ) -> Result<Vec<SecurityGroupRule>> {
        self.enter("list_security_group_rules", false)?;
        let state = self.state.lock().unwrap();
        state
            .groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("security group {}", group_id)))
    }

    async fn create_security_group_rule(
        &self,
        _zone: Option<&str>,
        group_id: &str,
        rule: &RuleSpec,
    ) -> Result<()> {
        self.enter("create_security_group_rule", true)?;
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("rule");
        state
            .groups
            .entry(group_id.to_string())
            .or_default()
            .push(SecurityGroupRule {
                id,
                spec: rule.clone(),
            });
        Ok(())
    }

    async fn delete_security_group_rule(
        &self,
        _zone: Option<&str>,
        group_id: &str,
        rule_id: &str,
    ) -> Result<()> {
        self.enter("delete_security_group_rule", true)?;
        let mut state = self.state.lock().unwrap();
        if let Some(rules) = state.groups.get_mut(group_id) {
            rules.retain(|r| r.id != rule_id);
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

/// A NodeLabeler recording every call
#[derive(Default)]
pub struct RecordingLabeler {
    calls: Mutex<Vec<(String, String, String)>>,
}

impl RecordingLabeler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeLabeler for RecordingLabeler {
    async fn set_label(&self, node: &str, key: &str, value: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((node.to_string(), key.to_string(), value.to_string()));
        Ok(())
    }
}

/// A membership source fed by the test
pub struct ControlledSource<T> {
    rx: Mutex<Option<mpsc::UnboundedReceiver<SourceEvent<T>>>>,
    watch_call_count: Arc<AtomicUsize>,
}

impl<T: Send + 'static> ControlledSource<T> {
    pub fn new() -> (Self, mpsc::UnboundedSender<SourceEvent<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            rx: Mutex::new(Some(rx)),
            watch_call_count: Arc::new(AtomicUsize::new(0)),
        };
        (source, tx)
    }

    pub fn watch_call_count(&self) -> usize {
        self.watch_call_count.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> MembershipSource<T> for ControlledSource<T> {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = SourceEvent<T>> + Send + 'static>> {
        self.watch_call_count.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("watch() can only be called once");
        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }

    fn source_name(&self) -> &'static str {
        "controlled"
    }
}

/// Node reporting an internal and an external address
pub fn node(name: &str, resource_version: &str, external: &str) -> Node {
    Node::new(name, resource_version)
        .with_address(NodeAddressType::InternalIp, "10.0.0.10")
        .with_address(NodeAddressType::ExternalIp, external)
}

/// Configuration with every synchronizer disabled and fast retries
pub fn minimal_config() -> ControllerConfig {
    ControllerConfig {
        engine: EngineConfig {
            number_retries: 3,
            backoff_base_ms: 1,
            backoff_max_secs: 1,
            event_channel_capacity: 1000,
            ..EngineConfig::default()
        },
        dns: DnsConfig {
            propagation_delay_secs: 0,
            ..DnsConfig::default()
        },
        ..ControllerConfig::default()
    }
}

/// Poll `condition` until it holds or a few seconds elapsed
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A node controller over the fakes, not yet running
pub fn node_controller(
    config: &ControllerConfig,
    cloud: Arc<FakeCloud>,
    labeler: Arc<RecordingLabeler>,
) -> (Controller<Node>, mpsc::Receiver<ControllerEvent>) {
    let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);
    let controller = Controller::new(
        "nodes",
        Arc::new(NodeEvents),
        node_synchronizers(config, cloud, labeler),
        &config.engine,
        1,
        tx,
    );
    (controller, rx)
}

/// A running engine over the fakes
pub struct Harness {
    pub cloud: Arc<FakeCloud>,
    pub labeler: Arc<RecordingLabeler>,
    pub nodes: mpsc::UnboundedSender<SourceEvent<Node>>,
    pub services: mpsc::UnboundedSender<SourceEvent<Service>>,
    pub events: mpsc::Receiver<ControllerEvent>,
    pub shutdown: watch::Sender<bool>,
    pub handle: JoinHandle<Result<()>>,
}

impl Harness {
    pub fn start(config: ControllerConfig, cloud: Arc<FakeCloud>) -> Self {
        let labeler = RecordingLabeler::new();
        let (node_source, nodes) = ControlledSource::new();
        let (service_source, services) = ControlledSource::new();

        let (engine, events) = NodegrantEngine::new(
            config,
            cloud.clone(),
            labeler.clone(),
            Box::new(node_source),
            Box::new(service_source),
        )
        .expect("engine construction succeeds");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { engine.run_with_shutdown(shutdown_rx).await });

        Self {
            cloud,
            labeler,
            nodes,
            services,
            events,
            shutdown,
            handle,
        }
    }

    /// Wait for the next event matching `predicate`, skipping the others
    pub async fn wait_for_event(
        &mut self,
        mut predicate: impl FnMut(&ControllerEvent) -> bool,
    ) -> ControllerEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("event channel open");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event arrives")
    }

    /// Flip the shutdown signal and wait for the engine to return
    pub async fn stop(self) -> Result<()> {
        self.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("engine stops in time")
            .expect("engine task completes")
    }
}
