//! Clock and resolver seams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Wall clock and sleep primitive.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task. Dropping the future cancels the sleep.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the system time and the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Receives the "try another way of resolving names" signal.
pub trait ResolverSwitch: Send + Sync {
    fn toggle(&self);
}

/// Flips between normal and alternate name resolution.
///
/// Only records the choice. A transport that supports more than one lookup
/// strategy reads [`is_alternate`](Self::is_alternate) before each connection;
/// [`ReqwestTransport`](crate::transport::ReqwestTransport) always uses the
/// system resolver.
#[derive(Debug, Default)]
pub struct AlternateResolver {
    alternate: AtomicBool,
}

impl AlternateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the next lookups should use the alternate strategy.
    pub fn is_alternate(&self) -> bool {
        self.alternate.load(Ordering::Relaxed)
    }
}

impl ResolverSwitch for AlternateResolver {
    fn toggle(&self) {
        let previous = self.alternate.fetch_xor(true, Ordering::Relaxed);
        tracing::debug!(alternate = !previous, "Switching name resolution strategy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternate_resolver_toggles() {
        let resolver = AlternateResolver::new();
        assert!(!resolver.is_alternate());

        resolver.toggle();
        assert!(resolver.is_alternate());

        resolver.toggle();
        assert!(!resolver.is_alternate());
    }

    #[tokio::test]
    async fn test_system_clock_sleeps() {
        let before = std::time::Instant::now();
        SystemClock.sleep(Duration::from_millis(20)).await;
        assert!(before.elapsed() >= Duration::from_millis(20));
    }
}
