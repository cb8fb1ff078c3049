//! In-process provider
//!
//! `MemorySources` is a set of named sources that live inside the process.
//! Publishing to a source delivers the update to every connection currently
//! subscribed to it. Useful for demos, simulations and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::registry::{Connection, ConnectionFactory, SourceLocator, UpdateData};

use super::{Provider, ProviderFactory};

/// Default per-connection feed capacity
pub const DEFAULT_FEED_CAPACITY: usize = 64;

#[derive(Default)]
struct SourceState {
    feeds: Vec<mpsc::Sender<UpdateData>>,
    subscribe_count: usize,
    refusal: Option<String>,
}

/// Registry of in-process sources
///
/// Clones share the same sources.
#[derive(Clone)]
pub struct MemorySources {
    sources: Arc<Mutex<HashMap<SourceLocator, SourceState>>>,
    feed_capacity: usize,
}

impl MemorySources {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(feed_capacity: usize) -> Self {
        Self {
            sources: Arc::new(Mutex::new(HashMap::new())),
            feed_capacity: feed_capacity.max(1),
        }
    }

    /// Make a source known; registering an unknown locator fails
    pub fn add_source(&self, locator: impl Into<SourceLocator>) {
        self.lock().entry(locator.into()).or_default();
    }

    /// Make subsequent connection attempts to `locator` fail
    pub fn refuse_connections(&self, locator: impl Into<SourceLocator>, reason: impl Into<String>) {
        self.lock().entry(locator.into()).or_default().refusal = Some(reason.into());
    }

    /// Deliver an update to every live connection on `locator`
    ///
    /// Returns the number of connections that received it.
    pub async fn publish(&self, locator: &SourceLocator, data: UpdateData) -> usize {
        let feeds = {
            let mut sources = self.lock();
            match sources.get_mut(locator) {
                Some(state) => {
                    state.feeds.retain(|feed| !feed.is_closed());
                    state.feeds.clone()
                }
                None => return 0,
            }
        };

        let mut delivered = 0;
        for feed in feeds {
            if feed.send(data.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of subscribe calls made for `locator`
    pub fn subscribe_count(&self, locator: &SourceLocator) -> usize {
        self.lock()
            .get(locator)
            .map(|state| state.subscribe_count)
            .unwrap_or(0)
    }

    /// Number of connections on `locator` whose feed is still held
    pub fn live_feeds(&self, locator: &SourceLocator) -> usize {
        self.lock()
            .get(locator)
            .map(|state| state.feeds.iter().filter(|feed| !feed.is_closed()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SourceLocator, SourceState>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemorySources {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderFactory for MemorySources {
    type Provider = MemoryProvider;

    fn build_provider(&self, locator: &SourceLocator) -> Result<MemoryProvider> {
        if locator.as_str().trim().is_empty() {
            return Err(Error::invalid_locator(locator.as_str(), "empty locator"));
        }
        if !self.lock().contains_key(locator) {
            return Err(Error::invalid_locator(locator.as_str(), "unknown source"));
        }

        Ok(MemoryProvider {
            locator: locator.clone(),
            sources: self.clone(),
        })
    }
}

/// Provider for one in-process source
pub struct MemoryProvider {
    locator: SourceLocator,
    sources: MemorySources,
}

impl Provider for MemoryProvider {
    fn subscribe<D: Dispatcher>(
        self,
        factory: ConnectionFactory<D>,
    ) -> impl std::future::Future<Output = Result<Connection<D>>> + Send + 'static {
        let feed = {
            let mut sources = self.sources.lock();
            let state = sources.entry(self.locator.clone()).or_default();
            state.subscribe_count += 1;

            match &state.refusal {
                Some(reason) => Err(Error::connect_failed(&self.locator, reason.clone())),
                None => {
                    let (tx, rx) = mpsc::channel(self.sources.feed_capacity);
                    state.feeds.push(tx);
                    Ok(rx)
                }
            }
        };

        tracing::debug!(locator = %self.locator, accepted = feed.is_ok(), "Memory subscribe");

        async move {
            let feed = feed?;
            Ok(factory.build(feed))
        }
    }
}
