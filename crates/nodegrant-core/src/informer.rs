// # Informer
//
// Consumes a membership feed, keeps the membership cache current, and turns
// every cache change into a queue key through an `EventTranslator`.
//
// ## Ordering
//
// The cache is updated before the key is enqueued, so a worker that picks
// the key always reads a snapshot at least as new as the event.
//
// ## Sync state
//
// `has_synced` becomes true once the first full listing has been applied.
// Workers must not start before that: an empty cache would make every
// known key look deleted.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::cache::MembershipCache;
use crate::queue::ReconcileQueue;
use crate::traits::{Member, SourceEvent};
use crate::translator::{EventTranslator, MembershipEvent};

/// Boxed membership feed
pub type SourceStream<T> = Pin<Box<dyn Stream<Item = SourceEvent<T>> + Send + 'static>>;

/// Feeds the cache and the queue from a membership feed
pub struct Informer<T: Member> {
    name: &'static str,
    cache: MembershipCache<T>,
    translator: Arc<dyn EventTranslator<T>>,
    queue: Arc<ReconcileQueue>,
    synced: watch::Sender<bool>,
}

impl<T: Member> Informer<T> {
    /// Create an informer writing into `cache` and `queue`
    pub fn new(
        name: &'static str,
        cache: MembershipCache<T>,
        translator: Arc<dyn EventTranslator<T>>,
        queue: Arc<ReconcileQueue>,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            name,
            cache,
            translator,
            queue,
            synced,
        }
    }

    /// Whether the initial listing has been applied
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolve once the initial listing has been applied
    pub async fn wait_for_sync(&self) {
        let mut synced = self.synced.subscribe();
        let _ = synced.wait_for(|synced| *synced).await;
    }

    /// Apply one feed event to the cache and enqueue the affected keys
    pub fn apply(&self, event: SourceEvent<T>) {
        match event {
            SourceEvent::Listed(items) => {
                let replaced = self.cache.replace_all(items);
                debug!(
                    "{}: listing applied ({} objects, {} removed)",
                    self.name,
                    replaced.applied.len(),
                    replaced.removed.len()
                );
                for (old, new) in replaced.applied {
                    self.dispatch(match old {
                        Some(old) => MembershipEvent::Updated { old, new },
                        None => MembershipEvent::Added(new),
                    });
                }
                for gone in replaced.removed {
                    self.dispatch(MembershipEvent::Deleted(gone));
                }
                if !self.synced.send_replace(true) {
                    info!("{}: cache synced ({} objects)", self.name, self.cache.len());
                }
            }
            SourceEvent::Applied(item) => {
                let event = match self.cache.insert(item) {
                    (Some(old), new) => MembershipEvent::Updated { old, new },
                    (None, new) => MembershipEvent::Added(new),
                };
                self.dispatch(event);
            }
            SourceEvent::Deleted(item) => {
                let last = self
                    .cache
                    .remove(&item.key())
                    .unwrap_or_else(|| Arc::new(item));
                self.dispatch(MembershipEvent::Deleted(last));
            }
        }
    }

    fn dispatch(&self, event: MembershipEvent<T>) {
        match self.translator.translate(&event) {
            Some(key) => {
                debug!("{}: enqueueing {}", self.name, key);
                self.queue.add(key);
            }
            None => debug!("{}: ignoring event for {}", self.name, event.key()),
        }
    }

    /// Consume `stream` until it ends or `shutdown` flips to true
    pub async fn run(&self, mut stream: SourceStream<T>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!("{}: informer stopping", self.name);
                    return;
                }
                next = stream.next() => match next {
                    Some(event) => self.apply(event),
                    None => {
                        warn!("{}: membership feed ended", self.name);
                        return;
                    }
                },
            }
        }
    }
}

/// Resolve once `shutdown` is true or its sender is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // an error means the sender was dropped, which also ends the run
    let _ = shutdown.wait_for(|stop| *stop).await;
}
