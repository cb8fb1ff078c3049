//! Expiry-aware fan-out of upstream source updates
//!
//! `notifier-rs` connects to upstream data sources on behalf of any number of
//! destinations, keeping a single connection per source no matter how many
//! destinations are interested. Each update is dispatched to the destinations
//! whose expiry has not yet passed.
//!
//! - [`registry::Notifier`]: register/unregister destinations, inspect state
//! - [`provider`]: how upstream sources are reached
//! - [`dispatch`]: how notifications are delivered
//! - [`expiry`]: how loosely typed expiry input is interpreted
//!
//! # Example
//! ```no_run
//! use notifier_rs::dispatch::LogDispatcher;
//! use notifier_rs::provider::MemorySources;
//! use notifier_rs::Notifier;
//!
//! # async fn example() {
//! let sources = MemorySources::new();
//! sources.add_source("sensorA");
//!
//! let notifier = Notifier::new(sources.clone(), LogDispatcher::new());
//! notifier.register("sensorA", "alice@example.com", Some("18:00".into())).await;
//! notifier.register("sensorA", "bob@example.com", None).await;
//! # }
//! ```

pub mod dispatch;
pub mod error;
pub mod expiry;
pub mod provider;
pub mod registry;

pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use expiry::{ExpiryInput, ExpiryParser};
pub use provider::{Provider, ProviderFactory};
pub use registry::{DestinationId, Expiry, Notifier, NotifierConfig, SourceLocator, UpdateData};
