use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide generation counter, bumped every time a fresh channel is
/// obtained (initial connect, full reconnect, channel-only recreation).
///
/// Every `RuntimeConsumer` records the epoch active at its creation; every
/// channel-facing operation in the Delivery Loop re-checks `Current()`
/// before acting and silently skips if stale. This is the sole mechanism
/// that neutralizes in-flight work belonging to a dead channel.
#[derive(Debug, Default)]
pub struct EpochManager {
  current: AtomicU64,
}

impl EpochManager {
  pub fn new() -> Self {
    Self {
      current: AtomicU64::new(0),
    }
  }

  pub fn current(&self) -> u64 {
    self.current.load(Ordering::SeqCst)
  }

  /// Increments and returns the new epoch.
  pub fn bump(&self) -> u64 {
    self.current.fetch_add(1, Ordering::SeqCst) + 1
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn starts_at_zero() {
    let epoch = EpochManager::new();
    assert_eq!(epoch.current(), 0);
  }

  #[test]
  fn bump_is_monotonic() {
    let epoch = EpochManager::new();
    assert_eq!(epoch.bump(), 1);
    assert_eq!(epoch.bump(), 2);
    assert_eq!(epoch.current(), 2);
  }
}
