//! Kubernetes watch streams as membership feeds

use futures::{StreamExt, future};
use k8s_openapi::api::core::v1::{Node as K8sNode, Service as K8sService};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use nodegrant_core::traits::{MembershipSource, Node, Service, SourceEvent};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::convert::{node_from_k8s, service_from_k8s};

/// Folds watcher events into feed events
///
/// Objects delivered between `Init` and `InitDone` are buffered and emitted
/// as one [`SourceEvent::Listed`], both at startup and on every relist.
#[derive(Debug)]
pub(crate) struct ListState<T> {
    listing: Option<Vec<T>>,
}

impl<T> Default for ListState<T> {
    fn default() -> Self {
        Self { listing: None }
    }
}

impl<T> ListState<T> {
    pub(crate) fn on_event<K>(
        &mut self,
        event: Event<K>,
        convert: fn(K) -> Option<T>,
    ) -> Option<SourceEvent<T>> {
        match event {
            Event::Init => {
                debug!("Watch (re)listing");
                self.listing = Some(Vec::new());
                None
            }
            Event::InitApply(object) => {
                if let (Some(listing), Some(item)) = (self.listing.as_mut(), convert(object)) {
                    listing.push(item);
                }
                None
            }
            Event::InitDone => {
                let listing = self.listing.take().unwrap_or_default();
                debug!("Watch listed {} objects", listing.len());
                Some(SourceEvent::Listed(listing))
            }
            Event::Apply(object) => convert(object).map(SourceEvent::Applied),
            Event::Delete(object) => convert(object).map(SourceEvent::Deleted),
        }
    }
}

/// Membership feed backed by a Kubernetes watch
pub struct KubeSource<K, T> {
    api: Api<K>,
    convert: fn(K) -> Option<T>,
    name: &'static str,
}

impl KubeSource<K8sNode, Node> {
    /// Feed of every node of the cluster
    pub fn nodes(client: Client) -> Self {
        Self {
            api: Api::all(client),
            convert: node_from_k8s,
            name: "kubernetes-nodes",
        }
    }
}

impl KubeSource<K8sService, Service> {
    /// Feed of every service of every namespace
    pub fn services(client: Client) -> Self {
        Self {
            api: Api::all(client),
            convert: service_from_k8s,
            name: "kubernetes-services",
        }
    }
}

impl<K, T> MembershipSource<T> for KubeSource<K, T>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    fn watch(&self) -> Pin<Box<dyn Stream<Item = SourceEvent<T>> + Send + 'static>> {
        let convert = self.convert;
        let name = self.name;

        let events = watcher::watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .scan(ListState::default(), move |state, event| {
                let mapped = match event {
                    Ok(event) => state.on_event(event, convert),
                    Err(e) => {
                        warn!("Watch of {} failed, retrying: {}", name, e);
                        None
                    }
                };
                future::ready(Some(mapped))
            })
            .filter_map(future::ready);

        Box::pin(events)
    }

    fn source_name(&self) -> &'static str {
        self.name
    }
}
