use std::{fmt, marker::PhantomData};

use async_trait::async_trait;
use tracing::info;

use super::{ManagerError, ReleaseManager};

/// Releases values to the log.
pub struct LoggingReleaseManager<V, K> {
    label: String,
    _released: PhantomData<fn(&V, &K)>,
}

impl<V, K> LoggingReleaseManager<V, K> {
    /// Creates a release manager which tags every log line with `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            _released: PhantomData,
        }
    }
}

#[async_trait]
impl<V, K> ReleaseManager<V, K> for LoggingReleaseManager<V, K>
where
    V: fmt::Display + Send + Sync,
    K: fmt::Display + Send + Sync,
{
    async fn release(&self, value: &V, key: &K) -> Result<(), ManagerError> {
        info!("{} `{}`: {}", self.label, key, value);
        Ok(())
    }
}
