//! Live upstream connections
//!
//! A `Connection` owns one upstream feed for a source locator. Its routing
//! state (destinations and the cached update) sits behind a short-lived lock
//! shared with the [`ConnectionHandle`], so destination changes never wait on
//! a delivery in progress:
//!
//! ```text
//!   ConnectionHandle ──add/remove──► routes ◄──read── Connection task ──► Dispatcher::notify
//!          │                                               ▲
//!          └──────────catch-up requests───────────────────►┤
//!   upstream provider ─────────────feed────────────────────┘
//! ```
//!
//! Dropping the handle aborts the task, even one blocked in a delivery, which
//! drops the feed receiver. That is how the provider learns the connection was
//! lost.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;

use super::clock::Clock;
use super::data::{DestinationId, SourceLocator, UpdateData};
use super::destination::{DestinationSet, Expiry};

/// Builds connections bound to one source locator
///
/// Holds only the locator and read-only handles to the dispatcher and clock,
/// never the notifier itself.
pub struct ConnectionFactory<D> {
    locator: SourceLocator,
    dispatcher: Arc<D>,
    clock: Arc<dyn Clock>,
}

impl<D: Dispatcher> ConnectionFactory<D> {
    pub fn new(locator: SourceLocator, dispatcher: Arc<D>, clock: Arc<dyn Clock>) -> Self {
        Self {
            locator,
            dispatcher,
            clock,
        }
    }

    /// Locator the produced connections are bound to
    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    /// Create a connection for an accepted upstream feed
    pub fn build(&self, feed: mpsc::Receiver<UpdateData>) -> Connection<D> {
        tracing::trace!(locator = %self.locator, "Building connection");

        Connection {
            locator: self.locator.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            clock: Arc::clone(&self.clock),
            routes: SharedRoutes::default(),
            feed,
        }
    }
}

impl<D> Clone for ConnectionFactory<D> {
    fn clone(&self) -> Self {
        Self {
            locator: self.locator.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            clock: Arc::clone(&self.clock),
        }
    }
}

#[derive(Default)]
struct Routes {
    destinations: DestinationSet,
    last_data: Option<UpdateData>,
    /// Bumped on every upstream update
    generation: u64,
}

/// Request to send the cached update to one newly added destination
#[derive(Debug)]
struct CatchUp {
    dest: DestinationId,
    generation: u64,
}

#[derive(Clone, Default)]
struct SharedRoutes(Arc<Mutex<Routes>>);

impl SharedRoutes {
    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Upsert a destination
    ///
    /// Returns a catch-up request when the entry is new or changed and an
    /// update is already cached.
    fn add(&self, locator: &SourceLocator, dest: DestinationId, expiry: Expiry) -> Option<CatchUp> {
        let mut routes = self.lock();
        let outcome = routes.destinations.upsert(dest.clone(), expiry);

        if !outcome.changed() {
            tracing::trace!(
                locator = %locator,
                destination = %dest,
                expiry = %expiry,
                "Destination already added"
            );
            return None;
        }

        tracing::trace!(
            locator = %locator,
            destination = %dest,
            expiry = %expiry,
            outcome = ?outcome,
            "Add/update destination"
        );

        if routes.last_data.is_none() {
            tracing::trace!(locator = %locator, "No data received, unable to notify");
            return None;
        }

        Some(CatchUp {
            dest,
            generation: routes.generation,
        })
    }

    fn remove(&self, locator: &SourceLocator, dest: &DestinationId) -> usize {
        let mut routes = self.lock();
        if routes.destinations.remove(dest).is_none() {
            tracing::warn!(
                locator = %locator,
                destination = %dest,
                "No destination found"
            );
        }
        routes.destinations.len()
    }

    fn destinations(&self) -> DestinationSet {
        self.lock().destinations.clone()
    }
}

/// One live upstream feed and the destinations listening to it
pub struct Connection<D> {
    locator: SourceLocator,
    dispatcher: Arc<D>,
    clock: Arc<dyn Clock>,
    routes: SharedRoutes,
    feed: mpsc::Receiver<UpdateData>,
}

impl<D: Dispatcher> Connection<D> {
    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    /// Snapshot of the current destinations
    pub fn destinations(&self) -> DestinationSet {
        self.routes.destinations()
    }

    /// Most recent update received from upstream
    pub fn last_data(&self) -> Option<UpdateData> {
        self.routes.lock().last_data.clone()
    }

    /// Add a destination or update its expiry
    ///
    /// A new or changed destination immediately receives the cached update,
    /// if there is one, without waiting for the next upstream update.
    pub async fn add_destination(&self, dest: DestinationId, expiry: Expiry) {
        if let Some(request) = self.routes.add(&self.locator, dest, expiry) {
            self.catch_up(request).await;
        }
    }

    /// Remove a destination, returning the number that remain
    pub fn remove_destination(&self, dest: &DestinationId) -> usize {
        self.routes.remove(&self.locator, dest)
    }

    /// Handle an update from upstream
    ///
    /// Caches the update and dispatches it once to every destination that has
    /// not expired at this moment.
    pub async fn on_data_received(&self, data: UpdateData) {
        tracing::trace!(
            locator = %self.locator,
            fields = data.fields().len(),
            "Data received"
        );

        let valid = {
            let mut routes = self.routes.lock();
            routes.generation += 1;
            routes.last_data = Some(data.clone());

            let (valid, expired) = routes.destinations.partition_at(self.clock.now());
            for dest in &expired {
                tracing::trace!(
                    locator = %self.locator,
                    destination = %dest,
                    "Destination expired"
                );
            }
            valid
        };

        self.dispatch(&data, &valid).await;
    }

    async fn catch_up(&self, request: CatchUp) {
        let data = {
            let routes = self.routes.lock();

            // A newer update was dispatched after the destination was added
            if routes.generation != request.generation {
                tracing::trace!(
                    locator = %self.locator,
                    destination = %request.dest,
                    "Cached update superseded"
                );
                return;
            }

            let Some(expiry) = routes.destinations.get(&request.dest) else {
                tracing::trace!(
                    locator = %self.locator,
                    destination = %request.dest,
                    "Destination removed before catch-up"
                );
                return;
            };

            if !expiry.is_valid_at(self.clock.now()) {
                tracing::trace!(
                    locator = %self.locator,
                    destination = %request.dest,
                    expiry = %expiry,
                    "Destination expired"
                );
                return;
            }

            match routes.last_data.clone() {
                Some(data) => data,
                None => return,
            }
        };

        self.dispatch(&data, std::slice::from_ref(&request.dest)).await;
    }

    async fn dispatch(&self, data: &UpdateData, destinations: &[DestinationId]) {
        if destinations.is_empty() {
            tracing::trace!(locator = %self.locator, "No valid destinations found");
            return;
        }

        match self.dispatcher.notify(&self.locator, data, destinations).await {
            Ok(()) => {
                tracing::trace!(
                    locator = %self.locator,
                    destinations = destinations.len(),
                    "Notification sent"
                );
            }
            Err(e) => {
                tracing::warn!(
                    locator = %self.locator,
                    error = %e,
                    "Error while sending notification"
                );
            }
        }
    }

    /// Start the connection task
    ///
    /// `initial` is the destination set accumulated while the connection was
    /// pending. Each entry is added before the task handles its first
    /// upstream update.
    pub fn spawn(self, initial: DestinationSet) -> ConnectionHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        for (dest, expiry) in initial {
            if let Some(request) = self.routes.add(&self.locator, dest, expiry) {
                let _ = tx.send(request);
            }
        }

        let locator = self.locator.clone();
        let routes = self.routes.clone();
        let task = tokio::spawn(self.run(rx));

        ConnectionHandle {
            locator,
            routes,
            catch_ups: tx,
            task,
        }
    }

    async fn run(mut self, mut catch_ups: mpsc::UnboundedReceiver<CatchUp>) {
        tracing::debug!(
            locator = %self.locator,
            destinations = self.routes.lock().destinations.len(),
            "Connection started"
        );

        let mut feed_open = true;
        loop {
            tokio::select! {
                biased;

                request = catch_ups.recv() => match request {
                    Some(request) => self.catch_up(request).await,
                    None => break,
                },
                data = self.feed.recv(), if feed_open => match data {
                    Some(data) => self.on_data_received(data).await,
                    None => {
                        feed_open = false;
                        tracing::info!(locator = %self.locator, "Upstream feed ended");
                    }
                },
            }
        }

        tracing::debug!(locator = %self.locator, "Connection closed");
    }
}

/// Handle to a running connection task
///
/// Destination changes apply immediately; only the catch-up delivery for a
/// late joiner is left to the task. Dropping the handle stops the task.
pub struct ConnectionHandle {
    locator: SourceLocator,
    routes: SharedRoutes,
    catch_ups: mpsc::UnboundedSender<CatchUp>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Add a destination or update its expiry
    pub fn add_destination(&self, dest: DestinationId, expiry: Expiry) {
        if let Some(request) = self.routes.add(&self.locator, dest, expiry) {
            if self.catch_ups.send(request).is_err() {
                tracing::warn!(
                    locator = %self.locator,
                    "Connection task gone, cached update not sent"
                );
            }
        }
    }

    /// Remove a destination, returning the number that remain
    pub fn remove_destination(&self, dest: &DestinationId) -> usize {
        self.routes.remove(&self.locator, dest)
    }

    /// Snapshot of the connection's destinations
    pub fn destinations(&self) -> DestinationSet {
        self.routes.destinations()
    }

    /// Whether the connection task has exited
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the connection and release the upstream feed
    pub fn close(self) {
        tracing::trace!(locator = %self.locator, "Closing connection");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
