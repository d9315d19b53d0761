use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_RETRY_COUNT;
use crate::constants::DEFAULT_RETRY_DELAY;

/// Tuning for [`crate::UsbAdapter`].
///
/// Applies to the open that precedes capability and landing page reads
/// during enumeration and on attach. Opens requested by the caller are
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdapterConfig {
  /// Extra attempts after the first failed open.
  pub retry_count: u32,
  pub retry_delay_ms: u64,
}

impl AdapterConfig {
  pub fn retry_delay(&self) -> Duration {
    Duration::from_millis(self.retry_delay_ms)
  }
}

impl Default for AdapterConfig {
  fn default() -> Self {
    Self {
      retry_count: DEFAULT_RETRY_COUNT,
      retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
    }
  }
}
