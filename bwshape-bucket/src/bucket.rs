use std::{num::NonZeroU64, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

/// The window over which a bucket produces `capacity` tokens when created with
/// [`TokenBucket::per_second`].
pub const DEFAULT_REFERENCE: Duration = Duration::from_secs(1);

/// A token bucket with tick-quantized debt accounting.
///
/// Tokens are produced in discrete ticks of `reference / capacity`. A consumer always
/// takes the tokens it asks for, pushing the balance negative if needed; the negative
/// balance (the debt) is translated into the delay the consumer has to wait out before
/// its request counts as served.
///
/// The bookkeeping happens under the bucket's own lock, in arrival order. The waiting
/// does not: callers compute their delay, release the lock and sleep concurrently, so
/// they queue implicitly through the shared balance.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Tokens produced per `reference`.
    capacity: u64,
    reference: Duration,
    /// Tick length in nanoseconds, never zero.
    interval: u128,
    /// The instant tick 0 starts at.
    origin: Instant,
    /// Token balance. Negative means debt.
    available: i64,
    /// Tick at which `available` was last replenished.
    last_tick: i64,
}

impl BucketState {
    fn new(reference: Duration, capacity: NonZeroU64, origin: Instant) -> Self {
        Self {
            capacity: capacity.get(),
            reference,
            interval: interval_nanos(reference, capacity),
            origin,
            available: 0,
            last_tick: 0,
        }
    }

    #[inline]
    fn tick(&self, now: Instant) -> i64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        i64::try_from(elapsed / self.interval).unwrap_or(i64::MAX)
    }

    /// Credits the ticks elapsed since the last replenishment. Ticks that pass while the
    /// bucket is full are not banked.
    fn replenish(&mut self, curr_tick: i64) {
        let capacity = i64::try_from(self.capacity).unwrap_or(i64::MAX);
        if self.available >= capacity {
            return;
        }

        self.available = self.available.saturating_add(curr_tick - self.last_tick).min(capacity);
        self.last_tick = curr_tick;
    }
}

#[inline]
fn interval_nanos(reference: Duration, capacity: NonZeroU64) -> u128 {
    (reference.as_nanos() / u128::from(capacity.get())).max(1)
}

impl TokenBucket {
    /// Creates a bucket producing `capacity` tokens every `reference`.
    pub fn new(reference: Duration, capacity: NonZeroU64) -> Self {
        Self::with_origin(reference, capacity, Instant::now())
    }

    /// Creates a bucket producing `capacity` tokens per second.
    pub fn per_second(capacity: NonZeroU64) -> Self {
        Self::new(DEFAULT_REFERENCE, capacity)
    }

    fn with_origin(reference: Duration, capacity: NonZeroU64, origin: Instant) -> Self {
        Self { state: Mutex::new(BucketState::new(reference, capacity, origin)) }
    }

    /// Returns the configured number of tokens per reference window.
    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    /// Takes `n` tokens at instant `now` and returns how long the caller has to wait
    /// before the tokens are considered produced.
    ///
    /// Requests for zero tokens return immediately and leave the bucket untouched.
    pub fn delay_at(&self, now: Instant, n: u64) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }

        let mut state = self.state.lock();

        let curr_tick = state.tick(now);
        state.replenish(curr_tick);

        state.available = state.available.saturating_sub(i64::try_from(n).unwrap_or(i64::MAX));
        if state.available >= 0 {
            return Duration::ZERO;
        }

        // The debt is paid off at tick `curr_tick - available`.
        let ticks = (i128::from(curr_tick) - i128::from(state.available)) as u128;
        let due = ticks.saturating_mul(state.interval);
        let due = Duration::from_nanos(u64::try_from(due).unwrap_or(u64::MAX));

        due.saturating_sub(now.saturating_duration_since(state.origin))
    }

    /// Like [`delay_at`](Self::delay_at), measured from now.
    #[inline]
    pub fn delay(&self, n: u64) -> Duration {
        self.delay_at(Instant::now(), n)
    }

    /// Takes `n` tokens and sleeps until they have been produced.
    ///
    /// Dropping the returned future cancels the sleep, but not the reservation.
    pub async fn wait(&self, n: u64) {
        let delay = self.delay(n);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Changes the rate at runtime.
    ///
    /// The tick origin moves to now while the balance and the last replenished tick are
    /// kept, so the first replenishment after a reset is computed against the old tick
    /// index and can subtract from the balance.
    pub fn reset(&self, capacity: NonZeroU64) {
        let mut state = self.state.lock();
        state.capacity = capacity.get();
        state.interval = interval_nanos(state.reference, capacity);
        state.origin = Instant::now();

        tracing::trace!(capacity = state.capacity, "token bucket reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Call {
        offset: Duration,
        count: u64,
        expected: Duration,
    }

    const fn call(offset_ms: u64, count: u64, expected_ms: u64) -> Call {
        Call {
            offset: Duration::from_millis(offset_ms),
            count,
            expected: Duration::from_millis(expected_ms),
        }
    }

    fn bucket(reference: Duration, capacity: u64) -> (TokenBucket, Instant) {
        let origin = Instant::now();
        let capacity = NonZeroU64::new(capacity).unwrap();
        (TokenBucket::with_origin(reference, capacity, origin), origin)
    }

    #[test]
    fn delay_table() {
        let cases = [
            (
                "several_calls",
                Duration::from_secs(1),
                1,
                vec![call(0, 0, 0), call(1_000, 1, 0), call(1_000, 1, 1_000)],
            ),
            ("capacity_exceeded", Duration::from_secs(1), 1, vec![call(0, 10, 10_000)]),
            (
                "sub_quant_time",
                Duration::from_millis(250),
                5,
                vec![call(0, 1, 50), call(0, 2, 150), call(0, 8, 550), call(300, 4, 450)],
            ),
        ];

        for (name, reference, capacity, calls) in cases {
            let (bucket, origin) = bucket(reference, capacity);
            for (i, c) in calls.iter().enumerate() {
                let got = bucket.delay_at(origin + c.offset, c.count);
                assert_eq!(got, c.expected, "{name}: call[{i}]");
            }
        }
    }

    #[test]
    fn zero_tokens_leave_state_untouched() {
        let (bucket, origin) = bucket(Duration::from_secs(1), 1);

        assert_eq!(bucket.delay_at(origin + Duration::from_secs(5), 0), Duration::ZERO);
        {
            let state = bucket.state.lock();
            assert_eq!(state.available, 0);
            assert_eq!(state.last_tick, 0);
        }

        // A zero-token call must not have advanced `last_tick`, so the five ticks are
        // still credited (and clamped) here.
        assert_eq!(bucket.delay_at(origin + Duration::from_secs(5), 1), Duration::ZERO);
    }

    #[test]
    fn saturated_ticks_are_not_banked() {
        let (bucket, origin) = bucket(Duration::from_secs(1), 1);
        let at = origin + Duration::from_secs(10);

        assert_eq!(bucket.delay_at(at, 1), Duration::ZERO);
        assert_eq!(bucket.delay_at(at, 1), Duration::from_secs(1));
    }

    #[test]
    fn debt_accumulates_linearly() {
        let (bucket, origin) = bucket(Duration::from_secs(1), 100);

        assert_eq!(bucket.delay_at(origin, 100), Duration::from_secs(1));
        assert_eq!(bucket.delay_at(origin, 100), Duration::from_secs(2));
        assert_eq!(bucket.delay_at(origin, 50), Duration::from_millis(2_500));
    }

    #[test]
    fn reset_keeps_the_balance() {
        let (bucket, origin) = bucket(Duration::from_secs(1), 10);
        assert_eq!(bucket.delay_at(origin, 10), Duration::from_secs(1));

        bucket.reset(NonZeroU64::new(20).unwrap());
        assert_eq!(bucket.capacity(), 20);

        let state = bucket.state.lock();
        assert_eq!(state.available, -10);
        assert_eq!(state.interval, Duration::from_millis(50).as_nanos());
    }

    #[test]
    fn huge_capacity_keeps_a_nonzero_tick() {
        let (bucket, origin) = bucket(Duration::from_secs(1), u64::MAX);
        assert_eq!(bucket.state.lock().interval, 1);
        assert_eq!(bucket.delay_at(origin, 1), Duration::from_nanos(1));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_off_the_debt() {
        let bucket = TokenBucket::per_second(NonZeroU64::new(10).unwrap());
        let start = Instant::now();

        bucket.wait(20).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2_010), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_queue_in_arrival_order() {
        let bucket = std::sync::Arc::new(TokenBucket::per_second(NonZeroU64::new(4).unwrap()));

        // Reservations are taken in order, the sleeps overlap.
        let first = bucket.delay(2);
        let second = bucket.delay(2);
        let third = bucket.delay(2);

        assert_eq!(first, Duration::from_millis(500));
        assert_eq!(second, Duration::from_secs(1));
        assert_eq!(third, Duration::from_millis(1_500));

        let start = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let bucket = std::sync::Arc::clone(&bucket);
                tokio::spawn(async move { bucket.wait(1).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        // Three more tokens on top of six in debt: the last one is due at 2.25s.
        assert!(start.elapsed() >= Duration::from_millis(2_250));
        assert!(start.elapsed() < Duration::from_millis(2_300));
    }
}
