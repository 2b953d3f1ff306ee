use crate::SubnetMode;

/// A download/upload rate pair, in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub download: u64,
    pub upload: u64,
}

impl Limit {
    pub const fn new(download: u64, upload: u64) -> Self {
        Self { download, upload }
    }

    /// The same rate in both directions.
    pub const fn symmetric(rate: u64) -> Self {
        Self::new(rate, rate)
    }
}

/// Configuration applied when a [`Shaper`](crate::Shaper) is created.
#[derive(Debug, Clone, Default)]
pub struct ShaperOptions {
    /// The server-wide limit, shared by all connections.
    pub(crate) server: Option<Limit>,
    /// Subnet limits, applied in order. A later entry for the same network replaces the
    /// earlier one.
    pub(crate) subnets: Vec<(String, Limit)>,
    /// How connections in the same subnet share its limit.
    pub(crate) mode: SubnetMode,
}

impl ShaperOptions {
    /// Sets the server-wide bandwidth. Calling this again replaces the previous value.
    pub fn server_bandwidth(mut self, limit: Limit) -> Self {
        self.server = Some(limit);
        self
    }

    /// Adds a bandwidth limit for the peers inside `cidr`.
    pub fn subnet_bandwidth(mut self, cidr: impl Into<String>, limit: Limit) -> Self {
        self.subnets.push((cidr.into(), limit));
        self
    }

    /// Sets how connections in the same subnet share its limit. Defaults to
    /// [`SubnetMode::Pooled`].
    pub fn subnet_mode(mut self, mode: SubnetMode) -> Self {
        self.mode = mode;
        self
    }
}
