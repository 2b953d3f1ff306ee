use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Statistics for a shaped stream. Shared between the stream and whoever holds a clone
/// of the `Arc`.
#[derive(Debug, Default)]
pub struct StreamStats {
    /// Total bytes read
    bytes_rx: AtomicU64,
    /// Total bytes written
    bytes_tx: AtomicU64,
    /// Total delay imposed by the shaper, in microseconds
    throttled_us: AtomicU64,
}

impl StreamStats {
    #[inline]
    pub(crate) fn increment_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_throttled(&self, delay: Duration) {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.throttled_us.fetch_add(micros, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    /// The sum of all delays the shaper handed to this stream.
    #[inline]
    pub fn throttled(&self) -> Duration {
        Duration::from_micros(self.throttled_us.load(Ordering::Relaxed))
    }
}
