use std::{num::NonZeroU64, sync::Arc, time::Duration};

use bwshape_bucket::{Direction, Throttle};
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    ConnectionId, OptionsError, PeerAddress, ShaperError, ShaperOptions, Subnet, SubnetLimit,
    SubnetMode, SubnetRegistry,
};

/// Combines the server-wide throttle with the per-subnet throttles.
///
/// A connection's effective rate in each direction is the lower of the two scopes, and
/// every byte it moves is drawn from both.
#[derive(Debug)]
pub struct Shaper {
    /// The server-wide throttle. Starts out as `unlimited`.
    server: RwLock<Arc<Throttle>>,
    registry: SubnetRegistry,
    unlimited: Arc<Throttle>,
}

impl Default for Shaper {
    fn default() -> Self {
        Self::new(SubnetMode::default())
    }
}

fn validate(download: u64, upload: u64) -> Result<(NonZeroU64, NonZeroU64), ShaperError> {
    match (NonZeroU64::new(download), NonZeroU64::new(upload)) {
        (Some(download), Some(upload)) => Ok((download, upload)),
        _ => Err(ShaperError::InvalidLimit { download, upload }),
    }
}

impl Shaper {
    /// Creates a shaper without any limits.
    pub fn new(mode: SubnetMode) -> Self {
        let unlimited = Arc::new(Throttle::unlimited());

        Self {
            server: RwLock::new(Arc::clone(&unlimited)),
            registry: SubnetRegistry::new(Arc::clone(&unlimited), mode),
            unlimited,
        }
    }

    /// Creates a shaper and applies `options` in order: the server limit first, then
    /// every subnet limit. The first rejected entry aborts construction.
    pub fn with_options(options: &ShaperOptions) -> Result<Self, OptionsError> {
        let shaper = Self::new(options.mode);

        if let Some(limit) = options.server {
            shaper
                .add_server_limit(limit.download, limit.upload)
                .map_err(OptionsError::ServerLimit)?;
        }

        for (cidr, limit) in &options.subnets {
            shaper.add_subnet_limit(cidr, limit.download, limit.upload).map_err(|source| {
                OptionsError::SubnetLimit { cidr: cidr.clone(), source }
            })?;
        }

        Ok(shaper)
    }

    #[inline]
    fn server(&self) -> Arc<Throttle> {
        Arc::clone(&self.server.read())
    }

    /// Sets the server-wide limit, in bytes per second.
    ///
    /// A server that is already limited keeps its buckets (and their debt) and only
    /// changes rates.
    pub fn add_server_limit(&self, download: u64, upload: u64) -> Result<(), ShaperError> {
        let (download, upload) = validate(download, upload)?;

        let mut server = self.server.write();
        if server.is_unlimited() {
            *server = Arc::new(Throttle::new(download, upload));
        } else {
            server.reset(download, upload);
        }

        debug!(download = download.get(), upload = upload.get(), "server limit set");

        Ok(())
    }

    /// Sets the limit for the peers inside `cidr`, in bytes per second.
    pub fn add_subnet_limit(
        &self,
        cidr: &str,
        download: u64,
        upload: u64,
    ) -> Result<Subnet, ShaperError> {
        let (download, upload) = validate(download, upload)?;
        self.registry.add_limit(cidr, download, upload)
    }

    /// Registers a connection and returns the handle to shape it with.
    pub fn register_connection<P: PeerAddress + ?Sized>(
        &self,
        peer: &P,
    ) -> Result<ConnectionId, ShaperError> {
        self.registry.add_connection(peer)
    }

    pub fn unregister_connection(&self, id: ConnectionId) -> bool {
        self.registry.remove_connection(id)
    }

    /// The server-wide rate in `direction`. [`u64::MAX`] when unlimited.
    pub fn server_capacity(&self, direction: Direction) -> u64 {
        self.server.read().capacity(direction)
    }

    /// The rate `id` is held to in `direction`: the lower of the server and subnet rate.
    pub fn effective_capacity(&self, id: ConnectionId, direction: Direction) -> u64 {
        self.server_capacity(direction).min(self.registry.throttle(id).capacity(direction))
    }

    /// Returns `true` if neither scope limits `id`.
    pub fn is_unlimited(&self, id: ConnectionId) -> bool {
        self.server.read().is_unlimited() && self.registry.throttle(id).is_unlimited()
    }

    /// Draws `n` tokens from the server throttle and then from the connection's throttle,
    /// and returns how long the caller has to wait.
    ///
    /// The connection's tokens are drawn as of the moment the server wait ends, so the
    /// result equals waiting out the two scopes one after the other.
    pub fn reserve_at(
        &self,
        id: ConnectionId,
        direction: Direction,
        now: Instant,
        n: u64,
    ) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }

        let server = self.server().delay_at(direction, now, n);
        let after = now.checked_add(server).unwrap_or(now);
        let subnet = self.registry.throttle(id).delay_at(direction, after, n);

        server.saturating_add(subnet)
    }

    #[inline]
    pub fn reserve(&self, id: ConnectionId, direction: Direction, n: u64) -> Duration {
        self.reserve_at(id, direction, Instant::now(), n)
    }

    /// Draws `n` tokens from both scopes, sleeping off each wait in turn.
    pub async fn consume(&self, id: ConnectionId, direction: Direction, n: u64) {
        self.server().consume(direction, n).await;
        self.registry.throttle(id).consume(direction, n).await;
    }

    /// Number of registered connections.
    pub fn connections(&self) -> usize {
        self.registry.len()
    }

    /// A snapshot of the configured subnet limits, in matching order.
    pub fn subnet_limits(&self) -> Vec<SubnetLimit> {
        self.registry.limits()
    }

    #[inline]
    pub const fn registry(&self) -> &SubnetRegistry {
        &self.registry
    }

    /// The throttle shared by every scope without a limit.
    #[inline]
    pub const fn unlimited(&self) -> &Arc<Throttle> {
        &self.unlimited
    }
}
