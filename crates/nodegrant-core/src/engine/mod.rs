//! Reconciliation controllers
//!
//! A [`Controller`] owns the membership cache, the reconciliation queue and
//! the ordered synchronizers of one membership category. The
//! [`NodegrantEngine`] wires the node and service controllers together and
//! runs them until shutdown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ MembershipSource │─── SourceEvent ───┐
//! └──────────────────┘                   │
//!                                        ▼
//!                               ┌────────────────┐
//!                               │    Informer    │── cache write
//!                               └────────────────┘
//!                                        │ key (EventTranslator)
//!                                        ▼
//!                               ┌────────────────┐
//!                               │ ReconcileQueue │
//!                               └────────────────┘
//!                                        │ get
//!         ┌──────────────────────────────┼──────────────────────────────┐
//!         ▼                              ▼                              ▼
//!   ┌──────────┐                   ┌──────────┐                   ┌──────────┐
//!   │ worker 1 │                   │ worker 2 │                   │ worker N │
//!   └──────────┘                   └──────────┘                   └──────────┘
//!         │   cache read + every synchronizer in order, then done
//!         ▼
//!   success: forget │ failure below the ceiling: add_rate_limited │ else: abandon
//! ```
//!
//! ## Pass outcome
//!
//! Every synchronizer runs on every pass, even after an earlier one failed.
//! The pass fails when at least one of them failed, and the error names
//! them all.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::MembershipCache;
use crate::config::{ControllerConfig, EngineConfig};
use crate::error::{Error, Result};
use crate::informer::{Informer, SourceStream, wait_for_shutdown};
use crate::queue::{ExponentialBackoff, ReconcileQueue};
use crate::sync::{
    DataStoreAclSync, NodeSecurityGroupSync, ReservedIpSync, ReverseDnsSync,
    ServiceSecurityGroupSync, Synchronizer,
};
use crate::traits::{Member, MembershipSource, Node, NodeLabeler, ResourceApi, Service};
use crate::translator::{EventTranslator, NodeEvents, ServiceEvents};

/// Events emitted by the controllers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Cache synced and workers started
    Started {
        controller: &'static str,
        workers: usize,
    },

    /// Every synchronizer succeeded for a key
    PassSucceeded {
        controller: &'static str,
        key: String,
    },

    /// A pass failed and the key was requeued with backoff
    PassFailed {
        controller: &'static str,
        key: String,
        error: String,
        retry_count: u32,
    },

    /// A key exhausted its retries and was dropped
    Abandoned {
        controller: &'static str,
        key: String,
        error: String,
    },

    /// Controller stopped
    Stopped {
        controller: &'static str,
        reason: String,
    },
}

/// Reconciliation controller for one membership category
///
/// ## Lifecycle
///
/// 1. Create with [`Controller::new()`]
/// 2. Start with [`Controller::run()`], which feeds the cache, waits for the
///    initial listing and spawns the workers
/// 3. Flip the shutdown signal: the queue drains, in-flight passes finish
///    and the workers exit
pub struct Controller<T: Member> {
    name: &'static str,
    cache: MembershipCache<T>,
    queue: Arc<ReconcileQueue>,
    informer: Arc<Informer<T>>,
    synchronizers: Vec<Arc<dyn Synchronizer<T>>>,
    max_retries: u32,
    workers: usize,
    event_tx: mpsc::Sender<ControllerEvent>,
}

impl<T: Member> Controller<T> {
    /// Create a controller
    ///
    /// # Parameters
    ///
    /// - `name`: Controller name used in logs and events
    /// - `translator`: Decides which membership events are worth a pass
    /// - `synchronizers`: Run in order on every pass
    /// - `engine`: Retry ceiling and backoff policy
    /// - `workers`: Number of concurrent worker tasks
    /// - `event_tx`: Sink for [`ControllerEvent`]s
    pub fn new(
        name: &'static str,
        translator: Arc<dyn EventTranslator<T>>,
        synchronizers: Vec<Arc<dyn Synchronizer<T>>>,
        engine: &EngineConfig,
        workers: usize,
        event_tx: mpsc::Sender<ControllerEvent>,
    ) -> Self {
        let cache = MembershipCache::new();
        let queue = Arc::new(ReconcileQueue::new(ExponentialBackoff::new(
            engine.backoff_base(),
            engine.backoff_max(),
        )));
        let informer = Arc::new(Informer::new(
            name,
            cache.clone(),
            translator,
            Arc::clone(&queue),
        ));

        Self {
            name,
            cache,
            queue,
            informer,
            synchronizers,
            max_retries: engine.number_retries,
            workers,
            event_tx,
        }
    }

    /// Controller name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The membership cache
    pub fn cache(&self) -> &MembershipCache<T> {
        &self.cache
    }

    /// The reconciliation queue
    pub fn queue(&self) -> &Arc<ReconcileQueue> {
        &self.queue
    }

    /// The informer feeding cache and queue
    pub fn informer(&self) -> &Arc<Informer<T>> {
        &self.informer
    }

    /// Run one reconciliation pass for `key`
    ///
    /// Reads the cache once and hands the same snapshot to every
    /// synchronizer.
    pub async fn reconcile(&self, key: &str) -> Result<()> {
        let member = self.cache.get(key);
        debug!(
            "{}: reconciling {} ({})",
            self.name,
            key,
            if member.is_some() { "present" } else { "absent" }
        );

        let mut failed = Vec::new();
        for synchronizer in &self.synchronizers {
            if let Err(e) = synchronizer.sync(key, member.as_deref()).await {
                warn!("{}: {} failed for {}: {}", self.name, synchronizer.name(), key, e);
                failed.push(synchronizer.name());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Sync {
                key: key.to_string(),
                failed,
            })
        }
    }

    /// Take one key from the queue and reconcile it
    ///
    /// Returns false once the queue is shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = self.reconcile(&key).await;
        self.handle_result(&key, result);
        self.queue.done(&key);
        true
    }

    fn handle_result(&self, key: &str, result: Result<()>) {
        match result {
            Ok(()) => {
                self.queue.forget(key);
                self.emit_event(ControllerEvent::PassSucceeded {
                    controller: self.name,
                    key: key.to_string(),
                });
            }
            Err(e) => {
                let retries = self.queue.num_requeues(key);
                if retries < self.max_retries {
                    warn!(
                        "{}: error syncing {} (retry {}/{}): {}",
                        self.name,
                        key,
                        retries + 1,
                        self.max_retries,
                        e
                    );
                    self.queue.add_rate_limited(key);
                    self.emit_event(ControllerEvent::PassFailed {
                        controller: self.name,
                        key: key.to_string(),
                        error: e.to_string(),
                        retry_count: retries + 1,
                    });
                } else {
                    error!(
                        "{}: dropping {} out of the queue after {} retries: {}",
                        self.name, key, retries, e
                    );
                    self.queue.forget(key);
                    self.emit_event(ControllerEvent::Abandoned {
                        controller: self.name,
                        key: key.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Run the controller until `shutdown` flips to true
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error::Membership)`: The membership feed ended on its own
    pub async fn run(
        self: Arc<Self>,
        stream: SourceStream<T>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let enabled: Vec<&str> = self
            .synchronizers
            .iter()
            .filter(|s| s.is_enabled())
            .map(|s| s.name())
            .collect();
        info!("{}: starting with synchronizers [{}]", self.name, enabled.join(", "));

        let mut feed = {
            let informer = Arc::clone(&self.informer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { informer.run(stream, shutdown).await })
        };

        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("{}: shutdown requested before the cache synced", self.name);
                self.queue.shut_down();
                if let Err(e) = feed.await {
                    warn!("{}: informer task failed: {}", self.name, e);
                }
                self.stopped("Shutdown signal");
                return Ok(());
            }
            _ = self.informer.wait_for_sync() => {}
            _ = &mut feed => {
                self.queue.shut_down();
                self.stopped("Membership feed ended");
                return Err(Error::membership(format!(
                    "{} feed ended before the cache synced",
                    self.name
                )));
            }
        }

        info!("{}: cache synced, starting {} workers", self.name, self.workers);
        self.emit_event(ControllerEvent::Started {
            controller: self.name,
            workers: self.workers,
        });

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let controller = Arc::clone(&self);
            workers.spawn(async move { while controller.process_next_item().await {} });
        }

        let feed_ended = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => false,
            _ = &mut feed => true,
        };

        info!("{}: shutting down workers", self.name);
        self.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("{}: worker failed: {}", self.name, e);
            }
        }

        if feed_ended {
            self.stopped("Membership feed ended");
            return Err(Error::membership(format!("{} feed ended", self.name)));
        }

        if let Err(e) = feed.await {
            warn!("{}: informer task failed: {}", self.name, e);
        }
        self.stopped("Shutdown signal");
        Ok(())
    }

    fn stopped(&self, reason: &str) {
        info!("{}: stopped ({})", self.name, reason);
        self.emit_event(ControllerEvent::Stopped {
            controller: self.name,
            reason: reason.to_string(),
        });
    }

    fn emit_event(&self, event: ControllerEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}

/// Synchronizers of the node controller, in pass order
pub fn node_synchronizers(
    config: &ControllerConfig,
    api: Arc<dyn ResourceApi>,
    labeler: Arc<dyn NodeLabeler>,
) -> Vec<Arc<dyn Synchronizer<Node>>> {
    vec![
        Arc::new(ReservedIpSync::new(
            Arc::clone(&api),
            labeler,
            &config.reserved_ips,
            config.reserved_ip_label.clone(),
        )),
        Arc::new(ReverseDnsSync::new(
            Arc::clone(&api),
            config.reverse_ip_domain.clone(),
            &config.dns,
        )),
        Arc::new(DataStoreAclSync::new(
            Arc::clone(&api),
            &config.database_ids,
            &config.redis_ids,
            config.nodes_ip_source,
        )),
        Arc::new(NodeSecurityGroupSync::new(api, &config.security_group_ids)),
    ]
}

/// Synchronizers of the service controller, in pass order
pub fn service_synchronizers(
    config: &ControllerConfig,
    api: Arc<dyn ResourceApi>,
) -> Vec<Arc<dyn Synchronizer<Service>>> {
    vec![Arc::new(ServiceSecurityGroupSync::new(
        api,
        &config.security_group_ids,
    ))]
}

/// The node and service controllers with their membership feeds
pub struct NodegrantEngine {
    nodes: Arc<Controller<Node>>,
    services: Arc<Controller<Service>>,
    node_source: Box<dyn MembershipSource<Node>>,
    service_source: Box<dyn MembershipSource<Service>>,
}

impl NodegrantEngine {
    /// Create the engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields the
    /// events of both controllers
    pub fn new(
        config: ControllerConfig,
        api: Arc<dyn ResourceApi>,
        labeler: Arc<dyn NodeLabeler>,
        node_source: Box<dyn MembershipSource<Node>>,
        service_source: Box<dyn MembershipSource<Service>>,
    ) -> Result<(Self, mpsc::Receiver<ControllerEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);

        let nodes = Controller::new(
            "nodes",
            Arc::new(NodeEvents),
            node_synchronizers(&config, Arc::clone(&api), labeler),
            &config.engine,
            config.engine.node_workers,
            tx.clone(),
        );
        let services = Controller::new(
            "services",
            Arc::new(ServiceEvents),
            service_synchronizers(&config, api),
            &config.engine,
            config.engine.service_workers,
            tx,
        );

        let engine = Self {
            nodes: Arc::new(nodes),
            services: Arc::new(services),
            node_source,
            service_source,
        };

        Ok((engine, rx))
    }

    /// The node controller
    pub fn nodes(&self) -> &Arc<Controller<Node>> {
        &self.nodes
    }

    /// The service controller
    pub fn services(&self) -> &Arc<Controller<Service>> {
        &self.services
    }

    /// Run both controllers until `shutdown` flips to true
    ///
    /// If one controller stops on its own, the other one is stopped too and
    /// the first error is returned.
    pub async fn run_with_shutdown(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Watching nodes from {} and services from {}",
            self.node_source.source_name(),
            self.service_source.source_name()
        );

        let (stop_tx, stop_rx) = watch::channel(false);

        let nodes = async {
            let result = Arc::clone(&self.nodes)
                .run(self.node_source.watch(), stop_rx.clone())
                .await;
            stop_tx.send_replace(true);
            result
        };
        let services = async {
            let result = Arc::clone(&self.services)
                .run(self.service_source.watch(), stop_rx.clone())
                .await;
            stop_tx.send_replace(true);
            result
        };
        let both = async { tokio::join!(nodes, services) };
        tokio::pin!(both);

        let (nodes, services) = tokio::select! {
            results = &mut both => results,
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Shutdown signal received");
                stop_tx.send_replace(true);
                both.await
            }
        };

        nodes.and(services)
    }
}
