//! Notifier configuration

use std::time::Duration;

/// Notifier configuration options
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    /// Give up on a connect attempt after this long (None = wait forever)
    ///
    /// A timed-out attempt is handled like any other connect failure: it is
    /// logged and the subscription stays pending. There is no retry.
    pub connect_timeout: Option<Duration>,
}

impl NotifierConfig {
    /// Set a connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}
