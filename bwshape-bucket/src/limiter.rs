use std::{num::NonZeroU64, time::Duration};

use tokio::time::Instant;

use crate::TokenBucket;

/// A rate limiter for one direction of one scope: either a [`TokenBucket`] or no limit
/// at all.
///
/// `Unlimited` is a tag rather than a bucket with a very large capacity, so "is this
/// scope bounded" is answered by matching on the variant.
#[derive(Debug)]
pub enum Limiter {
    Bucket(TokenBucket),
    Unlimited,
}

impl Limiter {
    /// A limiter producing `rate` tokens per second.
    pub fn per_second(rate: NonZeroU64) -> Self {
        Self::Bucket(TokenBucket::per_second(rate))
    }

    #[inline]
    pub const fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Tokens per reference window. [`u64::MAX`] for unlimited limiters.
    #[inline]
    pub fn capacity(&self) -> u64 {
        match self {
            Self::Bucket(bucket) => bucket.capacity(),
            Self::Unlimited => u64::MAX,
        }
    }

    #[inline]
    pub fn delay_at(&self, now: Instant, n: u64) -> Duration {
        match self {
            Self::Bucket(bucket) => bucket.delay_at(now, n),
            Self::Unlimited => Duration::ZERO,
        }
    }

    #[inline]
    pub fn delay(&self, n: u64) -> Duration {
        match self {
            Self::Bucket(bucket) => bucket.delay(n),
            Self::Unlimited => Duration::ZERO,
        }
    }

    pub async fn wait(&self, n: u64) {
        if let Self::Bucket(bucket) = self {
            bucket.wait(n).await;
        }
    }

    /// Changes the rate of a bucket. No-op for unlimited limiters.
    pub fn reset(&self, rate: NonZeroU64) {
        if let Self::Bucket(bucket) = self {
            bucket.reset(rate);
        }
    }
}
