//! Dispatcher that forwards notifications over a channel
//!
//! Useful for embedding the notifier in a larger service where delivery runs
//! on its own task, and for observing dispatches in tests.

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::registry::{DestinationId, SourceLocator, UpdateData};

use super::Dispatcher;

/// A single dispatch as seen by the delivery side
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Source the update came from
    pub locator: SourceLocator,
    /// The update payload
    pub data: UpdateData,
    /// Non-expired destinations, in id order
    pub destinations: Vec<DestinationId>,
}

/// Sends every dispatch as a [`Notification`] on a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<Notification>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    async fn notify(
        &self,
        locator: &SourceLocator,
        data: &UpdateData,
        destinations: &[DestinationId],
    ) -> Result<()> {
        let notification = Notification {
            locator: locator.clone(),
            data: data.clone(),
            destinations: destinations.to_vec(),
        };

        self.tx
            .send(notification)
            .await
            .map_err(|_| Error::Delivery("notification receiver dropped".into()))
    }
}
