use std::{fmt, num::NonZeroU64, time::Duration};

use tokio::time::Instant;

use crate::{Direction, Limiter};

/// A download and an upload [`Limiter`] bound to one scope, such as the whole server or
/// one subnet pool.
///
/// Throttles are shared behind an `Arc` by every connection assigned to them, so a rate
/// change is seen by all of those connections at once.
#[derive(Debug)]
pub struct Throttle {
    download: Limiter,
    upload: Limiter,
}

impl Throttle {
    /// A throttle allowing `download` and `upload` bytes per second.
    pub fn new(download: NonZeroU64, upload: NonZeroU64) -> Self {
        Self { download: Limiter::per_second(download), upload: Limiter::per_second(upload) }
    }

    /// A throttle that never limits either direction.
    pub const fn unlimited() -> Self {
        Self { download: Limiter::Unlimited, upload: Limiter::Unlimited }
    }

    /// Returns `true` if neither direction is limited.
    #[inline]
    pub const fn is_unlimited(&self) -> bool {
        self.download.is_unlimited() && self.upload.is_unlimited()
    }

    #[inline]
    pub const fn limiter(&self, direction: Direction) -> &Limiter {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }

    /// Bytes per second allowed in `direction`.
    #[inline]
    pub fn capacity(&self, direction: Direction) -> u64 {
        self.limiter(direction).capacity()
    }

    /// Takes `n` tokens in `direction` and returns the resulting delay.
    #[inline]
    pub fn delay(&self, direction: Direction, n: u64) -> Duration {
        self.limiter(direction).delay(n)
    }

    #[inline]
    pub fn delay_at(&self, direction: Direction, now: Instant, n: u64) -> Duration {
        self.limiter(direction).delay_at(now, n)
    }

    /// Takes `n` tokens in `direction` and sleeps off the delay.
    pub async fn consume(&self, direction: Direction, n: u64) {
        self.limiter(direction).wait(n).await;
    }

    /// Re-configures both directions together.
    pub fn reset(&self, download: NonZeroU64, upload: NonZeroU64) {
        self.download.reset(download);
        self.upload.reset(upload);
    }
}

impl fmt::Display for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            return f.write_str("unlimited");
        }

        write!(f, "dl: {}B/s ul: {}B/s", self.download.capacity(), self.upload.capacity())
    }
}
