//! Upstream providers
//!
//! A provider knows how to reach one upstream source. The notifier asks a
//! [`ProviderFactory`] for a provider the first time a locator is registered,
//! then calls [`Provider::subscribe`] exactly once and waits for the returned
//! future to resolve to a live [`Connection`].
//!
//! Providers deliver updates through the `mpsc::Receiver<UpdateData>` feed
//! they hand to [`ConnectionFactory::build`]. When the receiver is dropped the
//! connection is gone and the provider should release the upstream resource.

pub mod memory;

use std::future::Future;

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::registry::{Connection, ConnectionFactory, SourceLocator};

pub use memory::{MemoryProvider, MemorySources};

/// Builds providers from source locators
pub trait ProviderFactory: Send + Sync + 'static {
    type Provider: Provider;

    /// Fails with `Error::InvalidLocator` for malformed or unknown locators
    fn build_provider(&self, locator: &SourceLocator) -> Result<Self::Provider>;
}

/// Single-shot connector to one upstream source
pub trait Provider: Send + 'static {
    /// Connect to the source, producing a connection through `factory`
    fn subscribe<D: Dispatcher>(
        self,
        factory: ConnectionFactory<D>,
    ) -> impl Future<Output = Result<Connection<D>>> + Send + 'static;
}
