//! Dispatcher that only logs

use crate::error::Result;
use crate::registry::{DestinationId, SourceLocator, UpdateData};

use super::Dispatcher;

/// Logs each notification at info level
#[derive(Debug, Clone, Default)]
pub struct LogDispatcher;

impl LogDispatcher {
    pub fn new() -> Self {
        Self
    }
}

impl Dispatcher for LogDispatcher {
    async fn notify(
        &self,
        locator: &SourceLocator,
        data: &UpdateData,
        destinations: &[DestinationId],
    ) -> Result<()> {
        tracing::info!(
            locator = %locator,
            name = %data.name("UnknownDevice"),
            value = %data.display_value("<NAN>"),
            destinations = ?destinations,
            "Notification"
        );
        Ok(())
    }
}
