//! Notifier implementation
//!
//! The central registry that maps source locators to subscriptions and routes
//! upstream updates to destinations through the injected dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::dispatch::Dispatcher;
use crate::expiry::{self, DefaultExpiryParser, ExpiryInput, ExpiryParser};
use crate::provider::{Provider, ProviderFactory};

use super::clock::{Clock, SystemClock};
use super::config::NotifierConfig;
use super::connection::ConnectionFactory;
use super::data::{DestinationId, SourceLocator};
use super::destination::{DestinationSet, Expiry};
use super::subscription::{Subscription, SubscriptionStats};

/// Central registry of subscriptions
///
/// Holds at most one subscription, and so at most one upstream connection,
/// per source locator. `register` and `unregister` take the registry write
/// lock for their whole duration, so they are applied one at a time. Neither
/// waits on a delivery, so a dispatcher may call back into the notifier.
pub struct Notifier<P, D> {
    /// Map of source locator to subscription
    subscriptions: RwLock<HashMap<SourceLocator, Arc<Mutex<Subscription>>>>,

    providers: P,
    dispatcher: Arc<D>,
    clock: Arc<dyn Clock>,
    expiry_parser: Arc<dyn ExpiryParser>,
    config: NotifierConfig,
}

impl<P, D> Notifier<P, D>
where
    P: ProviderFactory,
    D: Dispatcher,
{
    /// Create a notifier with default configuration
    pub fn new(providers: P, dispatcher: D) -> Self {
        Self::with_config(providers, dispatcher, NotifierConfig::default())
    }

    /// Create a notifier with custom configuration
    pub fn with_config(providers: P, dispatcher: D, config: NotifierConfig) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            providers,
            dispatcher: Arc::new(dispatcher),
            clock: Arc::new(SystemClock),
            expiry_parser: Arc::new(DefaultExpiryParser),
            config,
        }
    }

    /// Use a different time source for expiry checks
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Use a different parser for textual expiry input
    pub fn with_expiry_parser(mut self, parser: impl ExpiryParser) -> Self {
        self.expiry_parser = Arc::new(parser);
        self
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Register interest of `dest` in updates from `locator`
    ///
    /// The first registration for a locator builds a provider and starts
    /// connecting in the background; this call does not wait for it. A
    /// locator the provider factory rejects is logged and ignored. Expiry
    /// input that cannot be read means the destination never expires.
    pub async fn register(
        &self,
        locator: impl Into<SourceLocator>,
        dest: impl Into<DestinationId>,
        expiry: Option<ExpiryInput>,
    ) {
        let locator = locator.into();
        let dest = dest.into();

        tracing::info!(
            locator = %locator,
            destination = %dest,
            expiry = ?expiry,
            "Register destination"
        );

        if dest.is_empty() {
            tracing::warn!(locator = %locator, "Empty destination, not registered");
            return;
        }

        let expiry = self.coerce_expiry(expiry.as_ref());
        let mut subscriptions = self.subscriptions.write().await;

        let subscription = match subscriptions.get(&locator) {
            Some(subscription) => {
                tracing::trace!(locator = %locator, "Subscription found");
                Arc::clone(subscription)
            }
            None => {
                tracing::trace!(locator = %locator, "No subscription, connecting");

                let provider = match self.providers.build_provider(&locator) {
                    Ok(provider) => provider,
                    Err(e) => {
                        tracing::warn!(
                            locator = %locator,
                            error = %e,
                            "Error building provider"
                        );
                        return;
                    }
                };

                let factory = ConnectionFactory::new(
                    locator.clone(),
                    Arc::clone(&self.dispatcher),
                    Arc::clone(&self.clock),
                );
                let subscription =
                    Subscription::start(locator.clone(), provider.subscribe(factory), &self.config);

                subscriptions.insert(locator.clone(), Arc::clone(&subscription));
                tracing::debug!(
                    locator = %locator,
                    subscriptions = subscriptions.len(),
                    "Subscription added"
                );
                subscription
            }
        };

        subscription.lock().await.add_destination(dest, expiry);
    }

    /// Withdraw interest of `dest` in updates from `locator`
    ///
    /// When the last destination leaves, the subscription is disconnected and
    /// removed. Unknown locators and destinations are logged and ignored.
    pub async fn unregister(&self, locator: impl Into<SourceLocator>, dest: impl Into<DestinationId>) {
        let locator = locator.into();
        let dest = dest.into();

        tracing::info!(locator = %locator, destination = %dest, "Unregister destination");

        let mut subscriptions = self.subscriptions.write().await;

        let Some(subscription) = subscriptions.get(&locator).cloned() else {
            tracing::warn!(locator = %locator, "No subscription found");
            return;
        };

        let mut subscription = subscription.lock().await;
        if subscription.remove_destination(&dest) == 0 {
            tracing::trace!(locator = %locator, "Last destination removed, disconnecting");
            subscription.disconnect();
            drop(subscription);

            subscriptions.remove(&locator);
            tracing::debug!(
                locator = %locator,
                subscriptions = subscriptions.len(),
                "Subscription removed"
            );
        }
    }

    /// Snapshot of every locator and its destinations
    pub async fn registered(&self) -> HashMap<SourceLocator, DestinationSet> {
        let subscriptions = self.subscriptions.read().await;

        let mut registered = HashMap::with_capacity(subscriptions.len());
        for (locator, subscription) in subscriptions.iter() {
            let destinations = subscription.lock().await.destinations();
            registered.insert(locator.clone(), destinations);
        }
        registered
    }

    /// Get subscription statistics
    pub async fn subscription_stats(&self, locator: &SourceLocator) -> Option<SubscriptionStats> {
        let subscriptions = self.subscriptions.read().await;
        let subscription = subscriptions.get(locator)?;
        let stats = subscription.lock().await.stats();
        Some(stats)
    }

    /// Get total number of subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Disconnect and remove every subscription
    pub async fn shutdown(&self) {
        let mut subscriptions = self.subscriptions.write().await;

        for (locator, subscription) in subscriptions.drain() {
            subscription.lock().await.disconnect();
            tracing::debug!(locator = %locator, "Subscription removed by shutdown");
        }

        tracing::info!("Notifier shut down");
    }

    fn coerce_expiry(&self, expiry: Option<&ExpiryInput>) -> Expiry {
        expiry::coerce(expiry, self.expiry_parser.as_ref(), self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::dispatch::{ChannelDispatcher, Notification};
    use crate::error::{Error, Result};
    use crate::provider::MemorySources;
    use crate::registry::clock::ManualClock;
    use crate::registry::connection::Connection;
    use crate::registry::data::UpdateData;
    use crate::registry::subscription::SubscriptionState;

    type TestNotifier = Notifier<MemorySources, ChannelDispatcher>;

    fn notifier(sources: &MemorySources) -> (TestNotifier, mpsc::Receiver<Notification>) {
        let (dispatcher, rx) = ChannelDispatcher::new(32);
        (Notifier::new(sources.clone(), dispatcher), rx)
    }

    fn update(value: i64) -> UpdateData {
        UpdateData::try_from(json!({ "value": value })).unwrap()
    }

    async fn wait_connected<P: ProviderFactory, D: Dispatcher>(
        notifier: &Notifier<P, D>,
        locator: &SourceLocator,
    ) {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let state = notifier.subscription_stats(locator).await.map(|s| s.state);
                if state == Some(SubscriptionState::Connected) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("subscription should connect");
    }

    async fn expect_notification(rx: &mut mpsc::Receiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("expected a notification")
            .expect("dispatcher channel closed")
    }

    async fn expect_silence(rx: &mut mpsc::Receiver<Notification>) {
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "unexpected notification: {:?}", result);
    }

    #[tokio::test]
    async fn test_single_connection_per_locator() {
        let sources = MemorySources::new();
        let locator = SourceLocator::new("sensorA");
        sources.add_source(&locator);
        let (notifier, _rx) = notifier(&sources);

        notifier.register(&locator, "alice", None).await;
        notifier.register(&locator, "bob", None).await;
        wait_connected(&notifier, &locator).await;
        notifier.register(&locator, "carol", None).await;

        assert_eq!(sources.subscribe_count(&locator), 1);
        assert_eq!(notifier.subscription_count().await, 1);
        assert_eq!(notifier.registered().await[&locator].len(), 3);
    }

    #[tokio::test]
    async fn test_expired_destination_excluded() {
        let sources = MemorySources::new();
        let locator = SourceLocator::new("sensorA");
        sources.add_source(&locator);
        let (notifier, mut rx) = notifier(&sources);

        let now = Utc::now();
        notifier
            .register(&locator, "alice", Some((now + chrono::Duration::hours(1)).into()))
            .await;
        notifier
            .register(&locator, "bob", Some((now - chrono::Duration::seconds(1)).into()))
            .await;
        wait_connected(&notifier, &locator).await;

        sources.publish(&locator, update(42)).await;

        let notification = expect_notification(&mut rx).await;
        assert_eq!(notification.locator, locator);
        assert_eq!(notification.data, update(42));
        assert_eq!(notification.destinations, vec![DestinationId::new("alice")]);
        expect_silence(&mut rx).await;
    }

    #[tokio::test]
    async fn test_expiry_evaluated_at_dispatch_time() {
        let sources = MemorySources::new();
        let locator = SourceLocator::new("sensorA");
        sources.add_source(&locator);

        let start = Utc.with_ymd_and_hms(2026, 10, 17, 8, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let (dispatcher, mut rx) = ChannelDispatcher::new(8);
        let notifier = Notifier::new(sources.clone(), dispatcher).with_clock(clock.clone());

        let t0 = start + chrono::Duration::minutes(30);
        notifier.register(&locator, "alice", Some(t0.into())).await;
        wait_connected(&notifier, &locator).await;

        clock.set(t0 - chrono::Duration::seconds(1));
        sources.publish(&locator, update(1)).await;
        assert_eq!(
            expect_notification(&mut rx).await.destinations,
            vec![DestinationId::new("alice")]
        );

        clock.set(t0 + chrono::Duration::seconds(1));
        sources.publish(&locator, update(2)).await;
        expect_silence(&mut rx).await;
    }

    #[tokio::test]
    async fn test_teardown_after_last_unregister() {
        let sources = MemorySources::new();
        let locator = SourceLocator::new("sensorA");
        sources.add_source(&locator);
        let (notifier, _rx) = notifier(&sources);

        for dest in ["alice", "bob", "carol"] {
            notifier.register(&locator, dest, None).await;
        }
        wait_connected(&notifier, &locator).await;
        assert_eq!(sources.live_feeds(&locator), 1);

        notifier.unregister(&locator, "alice").await;
        notifier.unregister(&locator, "bob").await;
        assert!(notifier.registered().await.contains_key(&locator));

        notifier.unregister(&locator, "carol").await;
        assert!(!notifier.registered().await.contains_key(&locator));
        assert_eq!(notifier.subscription_count().await, 0);

        tokio::time::timeout(Duration::from_secs(1), async {
            while sources.live_feeds(&locator) > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("upstream feed should be released");

        // A new registration opens a fresh connection
        notifier.register(&locator, "alice", None).await;
        wait_connected(&notifier, &locator).await;
        assert_eq!(sources.subscribe_count(&locator), 2);
    }

    #[tokio::test]
    async fn test_late_join_receives_cached_update() {
        let sources = MemorySources::new();
        let locator = SourceLocator::new("sensorA");
        sources.add_source(&locator);
        let (notifier, mut rx) = notifier(&sources);

        notifier.register(&locator, "alice", None).await;
        wait_connected(&notifier, &locator).await;
        sources.publish(&locator, update(7)).await;
        expect_notification(&mut rx).await;

        notifier.register(&locator, "carol", None).await;

        let notification = expect_notification(&mut rx).await;
        assert_eq!(notification.data, update(7));
        assert_eq!(notification.destinations, vec![DestinationId::new("carol")]);
        expect_silence(&mut rx).await;
    }

    #[tokio::test]
    async fn test_identical_registration_is_idempotent() {
        let sources = MemorySources::new();
        let locator = SourceLocator::new("sensorA");
        sources.add_source(&locator);
        let (notifier, mut rx) = notifier(&sources);

        notifier.register(&locator, "alice", Some("2999-01-01".into())).await;
        notifier.register(&locator, "alice", Some("2999-01-01".into())).await;
        wait_connected(&notifier, &locator).await;
        sources.publish(&locator, update(1)).await;
        expect_notification(&mut rx).await;

        notifier.register(&locator, "alice", Some("2999-01-01".into())).await;
        expect_silence(&mut rx).await;

        let registered = notifier.registered().await;
        assert_eq!(registered[&locator].len(), 1);
    }

    #[tokio::test]
    async fn test_reregistration_updates_expiry() {
        let sources = MemorySources::new();
        let locator = SourceLocator::new("sensorA");
        sources.add_source(&locator);
        let (notifier, _rx) = notifier(&sources);

        let first = Utc::now() + chrono::Duration::hours(1);
        let second = first + chrono::Duration::hours(1);
        notifier.register(&locator, "alice", Some(first.into())).await;
        notifier.register(&locator, "alice", Some(second.into())).await;

        let registered = notifier.registered().await;
        assert_eq!(registered[&locator].get(&"alice".into()), Some(Expiry::at(second)));
    }

    #[tokio::test]
    async fn test_invalid_locator_creates_nothing() {
        let sources = MemorySources::new();
        let (notifier, _rx) = notifier(&sources);

        notifier.register("nowhere", "alice", None).await;

        assert!(notifier.registered().await.is_empty());
        assert_eq!(notifier.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_destination_ignored() {
        let sources = MemorySources::new();
        sources.add_source("sensorA");
        let (notifier, _rx) = notifier(&sources);

        notifier.register("sensorA", "", None).await;

        assert_eq!(notifier.subscription_count().await, 0);
        assert_eq!(sources.subscribe_count(&"sensorA".into()), 0);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let sources = MemorySources::new();
        sources.add_source("sensorA");
        let (notifier, _rx) = notifier(&sources);

        notifier.unregister("sensorA", "alice").await;

        notifier.register("sensorA", "alice", None).await;
        notifier.unregister("sensorA", "bob").await;
        assert_eq!(notifier.registered().await[&SourceLocator::new("sensorA")].len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_expiry_never_expires() {
        let sources = MemorySources::new();
        sources.add_source("sensorA");
        let (notifier, _rx) = notifier(&sources);

        notifier.register("sensorA", "alice", Some("whenever".into())).await;

        let registered = notifier.registered().await;
        assert_eq!(
            registered[&SourceLocator::new("sensorA")].get(&"alice".into()),
            Some(Expiry::NEVER)
        );
    }

    #[tokio::test]
    async fn test_refused_connect_leaves_stalled_subscription() {
        let sources = MemorySources::new();
        let locator = SourceLocator::new("sensorA");
        sources.refuse_connections(&locator, "device offline");
        let (notifier, mut rx) = notifier(&sources);

        notifier.register(&locator, "alice", None).await;
        notifier.register(&locator, "bob", None).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let stats = notifier.subscription_stats(&locator).await;
                if stats.and_then(|s| s.connect_error).is_some() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connect failure should be recorded");

        let stats = notifier.subscription_stats(&locator).await.unwrap();
        assert_eq!(stats.state, SubscriptionState::Pending);
        assert_eq!(stats.destination_count, 2);
        assert_eq!(sources.subscribe_count(&locator), 1);
        expect_silence(&mut rx).await;

        notifier.unregister(&locator, "alice").await;
        notifier.unregister(&locator, "bob").await;
        assert_eq!(notifier.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let sources = MemorySources::new();
        sources.add_source("sensorA");
        sources.add_source("sensorB");
        let (notifier, _rx) = notifier(&sources);

        notifier.register("sensorA", "alice", None).await;
        notifier.register("sensorB", "alice", None).await;
        wait_connected(&notifier, &"sensorA".into()).await;
        wait_connected(&notifier, &"sensorB".into()).await;

        notifier.shutdown().await;

        assert_eq!(notifier.subscription_count().await, 0);
        tokio::time::timeout(Duration::from_secs(1), async {
            while sources.live_feeds(&"sensorA".into()) + sources.live_feeds(&"sensorB".into()) > 0
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("all feeds should be released");
    }

    /// Provider whose connect attempts resolve only when the test says so
    #[derive(Clone, Default)]
    struct GatedSources {
        gates: Arc<std::sync::Mutex<Vec<oneshot::Sender<mpsc::Receiver<UpdateData>>>>>,
        subscribes: Arc<AtomicUsize>,
    }

    impl GatedSources {
        /// Resolve the oldest outstanding connect, returning the upstream sender
        fn resolve_next(&self) -> mpsc::Sender<UpdateData> {
            let gate = self.gates.lock().unwrap().remove(0);
            let (tx, rx) = mpsc::channel(8);
            let _ = gate.send(rx);
            tx
        }
    }

    struct GatedProvider {
        locator: SourceLocator,
        gate: oneshot::Receiver<mpsc::Receiver<UpdateData>>,
    }

    impl ProviderFactory for GatedSources {
        type Provider = GatedProvider;

        fn build_provider(&self, locator: &SourceLocator) -> Result<GatedProvider> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().push(tx);
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(GatedProvider {
                locator: locator.clone(),
                gate: rx,
            })
        }
    }

    impl Provider for GatedProvider {
        fn subscribe<D: Dispatcher>(
            self,
            factory: ConnectionFactory<D>,
        ) -> impl std::future::Future<Output = Result<Connection<D>>> + Send + 'static {
            async move {
                let feed = self
                    .gate
                    .await
                    .map_err(|_| Error::connect_failed(&self.locator, "gate dropped"))?;
                Ok(factory.build(feed))
            }
        }
    }

    #[tokio::test]
    async fn test_unregister_before_connect_discards_connection() {
        let sources = GatedSources::default();
        let (dispatcher, mut rx) = ChannelDispatcher::new(8);
        let notifier = Notifier::new(sources.clone(), dispatcher);
        let locator = SourceLocator::new("sensorA");

        notifier.register(&locator, "alice", None).await;
        assert_eq!(
            notifier.subscription_stats(&locator).await.unwrap().state,
            SubscriptionState::Pending
        );

        notifier.unregister(&locator, "alice").await;
        assert!(notifier.registered().await.is_empty());

        // The connect attempt resolves after the subscription is gone
        let upstream = sources.resolve_next();
        tokio::time::timeout(Duration::from_secs(1), upstream.closed())
            .await
            .expect("late connection should be dropped");

        assert!(upstream.send(update(1)).await.is_err());
        expect_silence(&mut rx).await;
        assert_eq!(notifier.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_registrations_while_pending_are_flushed() {
        let sources = GatedSources::default();
        let (dispatcher, mut rx) = ChannelDispatcher::new(8);
        let notifier = Notifier::new(sources.clone(), dispatcher);
        let locator = SourceLocator::new("sensorA");

        notifier.register(&locator, "alice", None).await;
        notifier.register(&locator, "bob", None).await;
        notifier.register(&locator, "carol", None).await;
        notifier.unregister(&locator, "bob").await;
        assert_eq!(sources.subscribes.load(Ordering::SeqCst), 1);

        let upstream = sources.resolve_next();
        wait_connected(&notifier, &locator).await;
        upstream.send(update(5)).await.unwrap();

        let notification = expect_notification(&mut rx).await;
        assert_eq!(
            notification.destinations,
            vec![DestinationId::new("alice"), DestinationId::new("carol")]
        );
    }

    #[tokio::test]
    async fn test_consumer_unregisters_while_delivery_blocked() {
        let sources = MemorySources::new();
        let sensor_a = SourceLocator::new("sensorA");
        let sensor_b = SourceLocator::new("sensorB");
        sources.add_source(&sensor_a);
        sources.add_source(&sensor_b);

        // Room for a single queued notification
        let (dispatcher, mut rx) = ChannelDispatcher::new(1);
        let notifier = Notifier::new(sources.clone(), dispatcher);

        notifier.register(&sensor_a, "alice", None).await;
        notifier.register(&sensor_b, "bob", None).await;
        wait_connected(&notifier, &sensor_a).await;
        wait_connected(&notifier, &sensor_b).await;

        for value in 0..3 {
            sources.publish(&sensor_a, update(value)).await;
        }

        // Unsubscribe after the first alert while later ones are still queued
        let first = expect_notification(&mut rx).await;
        assert_eq!(first.destinations, vec![DestinationId::new("alice")]);

        tokio::time::timeout(Duration::from_secs(2), async {
            notifier.unregister(&sensor_a, "alice").await;
            notifier.register(&sensor_b, "carol", None).await;
        })
        .await
        .expect("registry should not wait on a blocked delivery");

        let registered = notifier.registered().await;
        assert!(!registered.contains_key(&sensor_a));
        assert_eq!(registered[&sensor_b].len(), 2);

        tokio::time::timeout(Duration::from_secs(1), async {
            while sources.live_feeds(&sensor_a) > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("upstream feed should be released");
    }

    /// Dispatcher whose delivery always crashes the connection task
    struct CrashingDispatcher;

    impl Dispatcher for CrashingDispatcher {
        async fn notify(
            &self,
            _locator: &SourceLocator,
            _data: &UpdateData,
            _destinations: &[DestinationId],
        ) -> Result<()> {
            panic!("delivery crashed")
        }
    }

    #[tokio::test]
    async fn test_dead_connection_keeps_destinations_until_unregistered() {
        let sources = MemorySources::new();
        let locator = SourceLocator::new("sensorA");
        sources.add_source(&locator);
        let notifier = Notifier::new(sources.clone(), CrashingDispatcher);

        notifier.register(&locator, "alice", None).await;
        wait_connected(&notifier, &locator).await;
        sources.publish(&locator, update(1)).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while sources.live_feeds(&locator) > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connection task should have stopped");

        // Registrations are still recorded after the task is gone
        notifier.register(&locator, "bob", None).await;
        assert_eq!(notifier.registered().await[&locator].len(), 2);

        notifier.unregister(&locator, "alice").await;
        assert_eq!(notifier.subscription_count().await, 1);

        notifier.unregister(&locator, "bob").await;
        assert_eq!(notifier.subscription_count().await, 0);
        assert!(notifier.registered().await.is_empty());
    }
}
