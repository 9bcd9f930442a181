// # Kubernetes Membership
//
// Membership feeds and the node labeler backed by the Kubernetes API.
//
// ## Feeds
//
// - `KubeSource::nodes`: every node, converted to `Node`
// - `KubeSource::services`: every service of every namespace, converted to
//   `Service`
//
// Each feed is a kube-rs watcher with the default backoff. Watch errors are
// logged and the watcher relists on its own; a relist is delivered as a new
// `SourceEvent::Listed`. The stream never ends while the process runs.
//
// ## Labeler
//
// `KubeLabeler` sets a single label with a JSON merge patch on the node
// object. The new label reaches the controllers through the node feed.

mod convert;
mod labeler;
mod watch;

pub use convert::{node_from_k8s, service_from_k8s};
pub use labeler::KubeLabeler;
pub use watch::KubeSource;
