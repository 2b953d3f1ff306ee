use std::{
    fmt,
    net::IpAddr,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bwshape_bucket::Throttle;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{IpAddrExt, PeerAddress, ShaperError, Subnet};

/// Opaque handle for a registered connection, issued by [`SubnetRegistry::add_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How connections matched to the same subnet share its bandwidth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubnetMode {
    /// All matched connections drain one shared throttle: the subnet as a whole is
    /// capped.
    #[default]
    Pooled,
    /// Every matched connection gets a throttle of its own at the subnet's rates: each
    /// connection is capped individually.
    PerConnection,
}

/// A configured subnet together with its rates and the throttle serving it.
#[derive(Debug, Clone)]
pub struct SubnetLimit {
    subnet: Subnet,
    download: NonZeroU64,
    upload: NonZeroU64,
    throttle: Arc<Throttle>,
}

impl SubnetLimit {
    fn new(subnet: Subnet, download: NonZeroU64, upload: NonZeroU64) -> Self {
        Self { subnet, download, upload, throttle: Arc::new(Throttle::new(download, upload)) }
    }

    #[inline]
    pub const fn subnet(&self) -> Subnet {
        self.subnet
    }

    /// Download rate in bytes per second.
    #[inline]
    pub const fn download(&self) -> u64 {
        self.download.get()
    }

    /// Upload rate in bytes per second.
    #[inline]
    pub const fn upload(&self) -> u64 {
        self.upload.get()
    }

    /// The pooled throttle. Connections only use it in [`SubnetMode::Pooled`].
    #[inline]
    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }
}

#[derive(Debug)]
struct Assignment {
    ip: IpAddr,
    throttle: Arc<Throttle>,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Ordered by descending prefix length, then by insertion order, so the first
    /// match is the longest-prefix match.
    limits: Vec<SubnetLimit>,
    connections: FxHashMap<ConnectionId, Assignment>,
}

/// Picks the throttle for `ip`: the first (longest) matching subnet's, or `unlimited`.
fn select(
    limits: &[SubnetLimit],
    ip: IpAddr,
    mode: SubnetMode,
    unlimited: &Arc<Throttle>,
) -> Arc<Throttle> {
    match limits.iter().find(|limit| limit.subnet.contains(ip)) {
        Some(limit) => match mode {
            SubnetMode::Pooled => Arc::clone(&limit.throttle),
            SubnetMode::PerConnection => Arc::new(Throttle::new(limit.download, limit.upload)),
        },
        None => Arc::clone(unlimited),
    }
}

impl RegistryState {
    /// Inserts or replaces the limit for `limit.subnet`. A replaced limit keeps its
    /// original position.
    fn upsert(&mut self, limit: SubnetLimit) {
        if let Some(existing) = self.limits.iter_mut().find(|l| l.subnet == limit.subnet) {
            *existing = limit;
            return;
        }

        let prefix_len = limit.subnet.prefix_len();
        let idx = self.limits.partition_point(|l| l.subnet.prefix_len() >= prefix_len);
        self.limits.insert(idx, limit);
    }
}

/// Keeps the configured subnet limits and the throttle every live connection is
/// assigned to.
///
/// Both live behind a single lock, so a limit change and the re-assignment of the
/// connections it affects are one atomic step for concurrent registrations.
pub struct SubnetRegistry {
    state: RwLock<RegistryState>,
    /// Shared by every connection that matches no subnet.
    unlimited: Arc<Throttle>,
    mode: SubnetMode,
    next_id: AtomicU64,
}

impl fmt::Debug for SubnetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SubnetRegistry")
            .field("mode", &self.mode)
            .field("limits", &state.limits.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl SubnetRegistry {
    /// Creates an empty registry. `unlimited` is handed out to connections that match no
    /// subnet.
    pub fn new(unlimited: Arc<Throttle>, mode: SubnetMode) -> Self {
        Self { state: RwLock::default(), unlimited, mode, next_id: AtomicU64::new(1) }
    }

    #[inline]
    pub const fn mode(&self) -> SubnetMode {
        self.mode
    }

    /// Adds a limit for `cidr`, or replaces the rates of an existing one.
    ///
    /// Every registered connection inside the subnet is re-assigned right away. This
    /// swaps in a fresh throttle, so any debt those connections built up under the old
    /// one is dropped.
    pub fn add_limit(
        &self,
        cidr: &str,
        download: NonZeroU64,
        upload: NonZeroU64,
    ) -> Result<Subnet, ShaperError> {
        let subnet = cidr.parse::<Subnet>()?;

        let mut state = self.state.write();
        state.upsert(SubnetLimit::new(subnet, download, upload));

        debug!(%subnet, download = download.get(), upload = upload.get(), "subnet limit set");

        let RegistryState { limits, connections } = &mut *state;
        for (id, assignment) in connections.iter_mut() {
            if subnet.contains(assignment.ip) {
                assignment.throttle = select(limits, assignment.ip, self.mode, &self.unlimited);
                debug!(%id, ip = %assignment.ip, throttle = %assignment.throttle, "connection reassigned");
            }
        }

        Ok(subnet)
    }

    /// Registers a connection by its peer address and assigns it a throttle.
    pub fn add_connection<P: PeerAddress + ?Sized>(
        &self,
        peer: &P,
    ) -> Result<ConnectionId, ShaperError> {
        let ip = peer.peer_ip().map_err(ShaperError::AddressResolutionFailed)?.canonical();
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut state = self.state.write();
        let throttle = select(&state.limits, ip, self.mode, &self.unlimited);

        debug!(%id, %ip, %throttle, "connection registered");
        state.connections.insert(id, Assignment { ip, throttle });

        Ok(id)
    }

    /// Returns the throttle assigned to `id`, or the unlimited throttle if `id` is not
    /// registered.
    pub fn throttle(&self, id: ConnectionId) -> Arc<Throttle> {
        self.state
            .read()
            .connections
            .get(&id)
            .map_or_else(|| Arc::clone(&self.unlimited), |a| Arc::clone(&a.throttle))
    }

    /// Forgets a connection. Returns `false` if it was not registered.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        let removed = self.state.write().connections.remove(&id).is_some();
        if removed {
            debug!(%id, "connection unregistered");
        }

        removed
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.state.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the configured limits, in matching order.
    pub fn limits(&self) -> Vec<SubnetLimit> {
        self.state.read().limits.clone()
    }
}
