//! Per-source subscription state
//!
//! A subscription tracks one source locator from the moment interest is first
//! registered until the last destination leaves:
//!
//! ```text
//!   Pending ──connect resolves──► Connected
//!      │                              │
//!      └────────► Disconnected ◄──────┘
//! ```
//!
//! While pending, destinations are buffered in the subscription itself. When
//! the connect attempt resolves, the buffer is moved into the connection, so
//! the destination set only ever has one owner. None of the operations here
//! wait on a delivery.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};

use super::config::NotifierConfig;
use super::connection::{Connection, ConnectionHandle};
use super::data::{DestinationId, SourceLocator};
use super::destination::{DestinationSet, Expiry};

/// Lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for the upstream connection (or stalled after a failed attempt)
    Pending,
    /// Upstream connection established
    Connected,
    /// Torn down; terminal
    Disconnected,
}

/// Statistics for a subscription
#[derive(Debug, Clone)]
pub struct SubscriptionStats {
    /// Current state
    pub state: SubscriptionState,
    /// Number of registered destinations
    pub destination_count: usize,
    /// Error of the failed connect attempt, if any
    pub connect_error: Option<String>,
    /// Time since the subscription was created
    pub age: Duration,
}

enum Phase {
    Pending {
        buffer: DestinationSet,
        connect_error: Option<String>,
    },
    Connected(ConnectionHandle),
    Disconnected,
}

/// Subscription for a single source locator
pub struct Subscription {
    locator: SourceLocator,
    phase: Phase,
    created_at: Instant,
}

impl Subscription {
    pub(super) fn new(locator: SourceLocator) -> Self {
        Self {
            locator,
            phase: Phase::Pending {
                buffer: DestinationSet::new(),
                connect_error: None,
            },
            created_at: Instant::now(),
        }
    }

    /// Create a pending subscription and spawn the task awaiting `connect`
    pub(super) fn start<D, F>(
        locator: SourceLocator,
        connect: F,
        config: &NotifierConfig,
    ) -> Arc<Mutex<Subscription>>
    where
        D: Dispatcher,
        F: Future<Output = Result<Connection<D>>> + Send + 'static,
    {
        let subscription = Arc::new(Mutex::new(Subscription::new(locator.clone())));
        let shared = Arc::clone(&subscription);
        let connect_timeout = config.connect_timeout;

        tokio::spawn(async move {
            let result = match connect_timeout {
                Some(limit) => tokio::time::timeout(limit, connect)
                    .await
                    .unwrap_or_else(|_| Err(Error::ConnectTimeout(locator))),
                None => connect.await,
            };

            let mut subscription = shared.lock().await;
            match result {
                Ok(connection) => subscription.on_connected(connection),
                Err(e) => subscription.on_connect_failed(e),
            }
        });

        subscription
    }

    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    pub fn state(&self) -> SubscriptionState {
        match self.phase {
            Phase::Pending { .. } => SubscriptionState::Pending,
            Phase::Connected(_) => SubscriptionState::Connected,
            Phase::Disconnected => SubscriptionState::Disconnected,
        }
    }

    /// Install the resolved connection
    ///
    /// A subscription that was disconnected in the meantime drops the
    /// connection instead, which releases its upstream feed.
    pub(super) fn on_connected<D: Dispatcher>(&mut self, connection: Connection<D>) {
        match std::mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::Pending { buffer, .. } => {
                tracing::debug!(
                    locator = %self.locator,
                    destinations = buffer.len(),
                    "Subscription connected"
                );
                self.phase = Phase::Connected(connection.spawn(buffer));
            }
            Phase::Disconnected => {
                tracing::debug!(
                    locator = %self.locator,
                    "Subscription has already been disconnected, dropping connection"
                );
            }
            Phase::Connected(existing) => {
                tracing::warn!(locator = %self.locator, "Subscription already connected");
                self.phase = Phase::Connected(existing);
            }
        }
    }

    pub(super) fn on_connect_failed(&mut self, error: Error) {
        tracing::warn!(locator = %self.locator, error = %error, "Subscribe failed");

        if let Phase::Pending { connect_error, .. } = &mut self.phase {
            *connect_error = Some(error.to_string());
        }
    }

    /// Add a destination or update its expiry
    pub fn add_destination(&mut self, dest: DestinationId, expiry: Expiry) {
        match &mut self.phase {
            Phase::Connected(connection) => connection.add_destination(dest, expiry),
            Phase::Pending { buffer, .. } => {
                if buffer.upsert(dest.clone(), expiry).changed() {
                    tracing::trace!(
                        locator = %self.locator,
                        destination = %dest,
                        expiry = %expiry,
                        "Add/update pending destination"
                    );
                } else {
                    tracing::trace!(
                        locator = %self.locator,
                        destination = %dest,
                        expiry = %expiry,
                        "Destination already added"
                    );
                }
            }
            Phase::Disconnected => {
                tracing::warn!(
                    locator = %self.locator,
                    destination = %dest,
                    "Subscription disconnected, destination ignored"
                );
            }
        }
    }

    /// Remove a destination, returning the number that remain
    pub fn remove_destination(&mut self, dest: &DestinationId) -> usize {
        match &mut self.phase {
            Phase::Connected(connection) => connection.remove_destination(dest),
            Phase::Pending { buffer, .. } => {
                if buffer.remove(dest).is_none() {
                    tracing::warn!(
                        locator = %self.locator,
                        destination = %dest,
                        "No destination found"
                    );
                }
                buffer.len()
            }
            Phase::Disconnected => 0,
        }
    }

    /// Snapshot of the current destinations, wherever they are held
    pub fn destinations(&self) -> DestinationSet {
        match &self.phase {
            Phase::Connected(connection) => connection.destinations(),
            Phase::Pending { buffer, .. } => buffer.clone(),
            Phase::Disconnected => DestinationSet::new(),
        }
    }

    /// Tear the subscription down
    ///
    /// Closes the connection if there is one. Calling it again does nothing.
    pub fn disconnect(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::Disconnected => {
                tracing::trace!(locator = %self.locator, "Already disconnected");
            }
            Phase::Connected(connection) => {
                tracing::trace!(locator = %self.locator, "Lose connection");
                connection.close();
            }
            Phase::Pending { .. } => {
                tracing::trace!(locator = %self.locator, "Disconnected while pending");
            }
        }
    }

    pub fn stats(&self) -> SubscriptionStats {
        let connect_error = match &self.phase {
            Phase::Pending { connect_error, .. } => connect_error.clone(),
            _ => None,
        };

        SubscriptionStats {
            state: self.state(),
            destination_count: self.destinations().len(),
            connect_error,
            age: self.created_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::dispatch::ChannelDispatcher;
    use crate::registry::clock::SystemClock;
    use crate::registry::connection::ConnectionFactory;
    use crate::registry::data::UpdateData;

    fn factory() -> ConnectionFactory<ChannelDispatcher> {
        let (dispatcher, _rx) = ChannelDispatcher::new(16);
        ConnectionFactory::new(
            SourceLocator::new("sensorA"),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
        )
    }

    fn connection() -> (Connection<ChannelDispatcher>, mpsc::Sender<UpdateData>) {
        let (tx, rx) = mpsc::channel(4);
        (factory().build(rx), tx)
    }

    async fn wait_for_state(subscription: &Arc<Mutex<Subscription>>, state: SubscriptionState) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while subscription.lock().await.state() != state {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("subscription did not reach expected state");
    }

    #[tokio::test]
    async fn test_pending_buffer_upserts() {
        let mut subscription = Subscription::new("sensorA".into());

        subscription.add_destination("alice".into(), Expiry::NEVER);
        subscription.add_destination("alice".into(), Expiry::NEVER);
        subscription.add_destination("bob".into(), Expiry::NEVER);

        assert_eq!(subscription.state(), SubscriptionState::Pending);
        assert_eq!(subscription.destinations().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_remove_counts() {
        let mut subscription = Subscription::new("sensorA".into());
        subscription.add_destination("alice".into(), Expiry::NEVER);
        subscription.add_destination("bob".into(), Expiry::NEVER);

        assert_eq!(subscription.remove_destination(&"carol".into()), 2);
        assert_eq!(subscription.remove_destination(&"alice".into()), 1);
        assert_eq!(subscription.remove_destination(&"bob".into()), 0);
    }

    #[tokio::test]
    async fn test_on_connected_moves_buffer_into_connection() {
        let mut subscription = Subscription::new("sensorA".into());
        subscription.add_destination("alice".into(), Expiry::NEVER);
        subscription.add_destination("bob".into(), Expiry::NEVER);

        let (connection, _feed) = connection();
        subscription.on_connected(connection);

        assert_eq!(subscription.state(), SubscriptionState::Connected);
        let destinations = subscription.destinations();
        assert_eq!(destinations.len(), 2);
        assert!(destinations.contains(&"alice".into()));
        assert!(destinations.contains(&"bob".into()));

        // Later changes go to the connection
        subscription.add_destination("carol".into(), Expiry::NEVER);
        assert_eq!(subscription.remove_destination(&"alice".into()), 2);
    }

    #[tokio::test]
    async fn test_late_connection_after_disconnect_is_dropped() {
        let mut subscription = Subscription::new("sensorA".into());
        subscription.add_destination("alice".into(), Expiry::NEVER);
        subscription.disconnect();

        let (connection, feed) = connection();
        subscription.on_connected(connection);

        assert_eq!(subscription.state(), SubscriptionState::Disconnected);
        assert!(feed.is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut subscription = Subscription::new("sensorA".into());
        let (connection, feed) = connection();
        subscription.on_connected(connection);

        subscription.disconnect();
        subscription.disconnect();

        assert_eq!(subscription.state(), SubscriptionState::Disconnected);
        tokio::time::timeout(Duration::from_secs(1), feed.closed())
            .await
            .expect("connection should release its feed");
    }

    #[tokio::test]
    async fn test_start_resolves_to_connected() {
        let (resolve, resolved) = oneshot::channel::<Connection<ChannelDispatcher>>();
        let connect = async move {
            resolved
                .await
                .map_err(|_| Error::connect_failed(&"sensorA".into(), "cancelled"))
        };

        let subscription =
            Subscription::start("sensorA".into(), connect, &NotifierConfig::default());
        subscription
            .lock()
            .await
            .add_destination("alice".into(), Expiry::NEVER);
        assert_eq!(subscription.lock().await.state(), SubscriptionState::Pending);

        let (connection, _feed) = connection();
        let _ = resolve.send(connection);

        wait_for_state(&subscription, SubscriptionState::Connected).await;
        let stats = subscription.lock().await.stats();
        assert_eq!(stats.destination_count, 1);
        assert!(stats.connect_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_stays_pending() {
        let connect = async {
            Err::<Connection<ChannelDispatcher>, _>(Error::connect_failed(
                &"sensorA".into(),
                "refused",
            ))
        };

        let subscription =
            Subscription::start("sensorA".into(), connect, &NotifierConfig::default());

        tokio::time::timeout(Duration::from_secs(1), async {
            while subscription.lock().await.stats().connect_error.is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connect error should be recorded");

        let mut subscription = subscription.lock().await;
        assert_eq!(subscription.state(), SubscriptionState::Pending);

        // A stalled subscription still accepts destination changes
        subscription.add_destination("alice".into(), Expiry::NEVER);
        assert_eq!(subscription.remove_destination(&"alice".into()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let connect = std::future::pending::<Result<Connection<ChannelDispatcher>>>();
        let config = NotifierConfig::default().connect_timeout(Duration::from_secs(5));

        let subscription = Subscription::start("sensorA".into(), connect, &config);
        tokio::time::sleep(Duration::from_secs(6)).await;

        let stats = subscription.lock().await.stats();
        assert_eq!(stats.state, SubscriptionState::Pending);
        assert_eq!(stats.connect_error.as_deref(), Some("Connect to sensorA timed out"));
    }
}
