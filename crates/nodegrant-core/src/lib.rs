// # nodegrant-core
//
// Core library of the nodegrant controller: keeps cloud resources (reserved
// IPs, reverse DNS, data-store allow-lists, security-group rules) in line
// with the nodes and services of a cluster.
//
// ## Architecture Overview
//
// - **MembershipSource**: Trait delivering node and service changes
// - **Informer**: Mirrors the feed into a `MembershipCache` and enqueues keys
// - **ReconcileQueue**: Deduplicating work queue with per-key backoff
// - **Synchronizer**: One resource category reconciled for one key
// - **ResourceApi**: Trait over the cloud provider's resource endpoints
// - **Controller / NodegrantEngine**: Worker pools draining the queues
//
// ## Design Principles
//
// 1. **Level-triggered**: Every pass recomputes desired and actual state
// 2. **Idempotent**: A pass on a converged key performs no mutation
// 3. **Tagged ownership**: Created objects carry the membership key
// 4. **Library-First**: The daemon only wires implementations together

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod informer;
pub mod queue;
pub mod sync;
pub mod traits;
pub mod translator;

// Re-export core types for convenience
pub use cache::MembershipCache;
pub use config::{AddressSource, ControllerConfig, DnsConfig, EngineConfig};
pub use engine::{Controller, ControllerEvent, NodegrantEngine};
pub use error::{Error, Result};
pub use informer::Informer;
pub use queue::{ExponentialBackoff, ReconcileQueue};
pub use sync::Synchronizer;
pub use traits::{MembershipSource, NodeLabeler, ResourceApi};
pub use translator::{EventTranslator, MembershipEvent};
