use std::fmt;

mod bucket;
pub use bucket::TokenBucket;

mod limiter;
pub use limiter::Limiter;

mod throttle;
pub use throttle::Throttle;

/// The direction of a byte flow, seen from the shaped side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes read from the peer.
    Download,
    /// Bytes written to the peer.
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => f.write_str("download"),
            Self::Upload => f.write_str("upload"),
        }
    }
}

#[allow(non_upper_case_globals)]
pub mod units {
    pub const KiB: u64 = 1024;
    pub const MiB: u64 = 1024 * KiB;
    pub const GiB: u64 = 1024 * MiB;

    /// One kilobyte per second, in bytes per second.
    pub const KBps: u64 = KiB;
    /// One megabyte per second, in bytes per second.
    pub const MBps: u64 = MiB;
}
