//! Subscription registry and update routing
//!
//! The registry keeps one subscription per source locator and routes updates
//! from each upstream connection to the destinations interested in it.
//!
//! # Architecture
//!
//! ```text
//!                          Notifier
//!                 ┌───────────────────────────┐
//!                 │ subscriptions: HashMap<   │
//!                 │   SourceLocator,          │
//!                 │   Subscription {          │
//!                 │     Pending(buffer)       │
//!                 │   | Connected(handle)     │
//!                 │   | Disconnected          │
//!                 │   }                       │
//!                 │ >                         │
//!                 └─────────────┬─────────────┘
//!                               │ one per locator
//!                               ▼
//!   Provider ──feed──►   Connection task   ──► Dispatcher::notify(locator, data, [dest..])
//!                        destinations,
//!                        last data
//! ```
//!
//! # Expiry
//!
//! Every destination carries an expiry. It is checked each time an update is
//! dispatched, not when the destination registers, so a destination silently
//! drops out of dispatches once its deadline passes.

pub mod clock;
pub mod config;
pub mod connection;
pub mod data;
pub mod destination;
pub mod store;
pub mod subscription;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::NotifierConfig;
pub use connection::{Connection, ConnectionFactory, ConnectionHandle};
pub use data::{DestinationId, SourceLocator, UpdateData};
pub use destination::{DestinationSet, Expiry, Upsert};
pub use store::Notifier;
pub use subscription::{Subscription, SubscriptionState, SubscriptionStats};
