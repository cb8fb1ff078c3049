//! Delivery of notifications
//!
//! The notifier decides *when* a payload goes out and *to whom*; a
//! [`Dispatcher`] decides *how*. One implementation exists per delivery
//! mechanism and is injected into the `Notifier` at construction.
//!
//! Implementations are awaited inline by the connection that produced the
//! update, so a slow delivery delays later updates for the same source.
//! Hand long-running work off to a task if that matters. Registering and
//! unregistering never wait on a delivery, so an implementation (or whoever
//! consumes its output) may call back into the notifier.

pub mod channel;
pub mod log;
pub mod writer;

use std::future::Future;

use crate::error::Result;
use crate::registry::{DestinationId, SourceLocator, UpdateData};

pub use channel::{ChannelDispatcher, Notification};
pub use log::LogDispatcher;
pub use writer::WriterDispatcher;

/// Delivery mechanism for notifications
///
/// `destinations` is never empty and contains only destinations whose expiry
/// had not passed when the dispatch was computed.
///
/// # Example
/// ```no_run
/// use notifier_rs::dispatch::Dispatcher;
/// use notifier_rs::error::Result;
/// use notifier_rs::registry::{DestinationId, SourceLocator, UpdateData};
///
/// struct Stdout;
///
/// impl Dispatcher for Stdout {
///     async fn notify(
///         &self,
///         locator: &SourceLocator,
///         data: &UpdateData,
///         destinations: &[DestinationId],
///     ) -> Result<()> {
///         for dest in destinations {
///             println!("{} -> {}: {}", locator, dest, data.display_value("?"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Dispatcher: Send + Sync + 'static {
    fn notify(
        &self,
        locator: &SourceLocator,
        data: &UpdateData,
        destinations: &[DestinationId],
    ) -> impl Future<Output = Result<()>> + Send;
}
