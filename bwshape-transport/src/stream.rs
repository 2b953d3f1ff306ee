use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::ready;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, ToSocketAddrs},
    time::{sleep, Sleep},
};
use tracing::{debug, trace, warn};

use bwshape_core::{units::KiB, ConnectionId, Direction, PeerAddress, Shaper, ShaperError};

use crate::StreamStats;

/// The largest amount of data moved by a single read or write, whatever the rate.
pub const MAX_CHUNK_SIZE: usize = 64 * KiB as usize;

/// Pacing state for one direction of a [`ShapedStream`].
struct Pacer {
    direction: Direction,
    /// The delay that has to elapse before the next I/O in this direction.
    delay: Option<Pin<Box<Sleep>>>,
    /// Bytes paid for ahead of an I/O that has not completed yet.
    prepaid: usize,
}

impl Pacer {
    const fn new(direction: Direction) -> Self {
        Self { direction, delay: None, prepaid: 0 }
    }

    /// Polls the outstanding delay, if any.
    fn poll_delay(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(ref mut delay) = self.delay {
            ready!(delay.as_mut().poll(cx));
            self.delay = None;
        }

        Poll::Ready(())
    }

    /// The largest slice handed to the inner stream at once.
    fn chunk_size(&self, shaper: &Shaper, id: ConnectionId) -> usize {
        let capacity = shaper.effective_capacity(id, self.direction);
        usize::try_from(capacity).unwrap_or(usize::MAX).clamp(1, MAX_CHUNK_SIZE)
    }

    /// Draws `n` bytes from the shaper and arms the resulting delay.
    fn charge(&mut self, shaper: &Shaper, id: ConnectionId, n: usize, stats: &StreamStats) {
        if n == 0 {
            return;
        }

        let delay = shaper.reserve(id, self.direction, n as u64);
        if !delay.is_zero() {
            trace!(%id, direction = %self.direction, bytes = n, ?delay, "throttled");
            stats.add_throttled(delay);
            self.delay = Some(Box::pin(sleep(delay)));
        }
    }

    /// Determines how many of `want` bytes to hand to the inner stream. Slices smaller than
    /// a chunk are paid for before the I/O, so this returns `Pending` until that payment's
    /// delay elapses.
    fn poll_admit(
        &mut self,
        cx: &mut Context<'_>,
        shaper: &Shaper,
        id: ConnectionId,
        want: usize,
        stats: &StreamStats,
    ) -> Poll<usize> {
        let chunk = self.chunk_size(shaper, id);
        if want >= chunk {
            return Poll::Ready(chunk);
        }

        if self.prepaid < want {
            self.charge(shaper, id, want - self.prepaid, stats);
            self.prepaid = want;
        }

        ready!(self.poll_delay(cx));
        Poll::Ready(want)
    }

    /// Drops the credit for a slice whose I/O failed. The tokens stay spent.
    fn forfeit(&mut self, err: io::Error) -> io::Error {
        self.prepaid = 0;
        err
    }

    /// Settles the account once `n` bytes went through: anything beyond the prepaid amount
    /// is charged now and served before the next I/O.
    fn settle(&mut self, shaper: &Shaper, id: ConnectionId, n: usize, stats: &StreamStats) {
        let prepaid = std::mem::take(&mut self.prepaid);
        self.charge(shaper, id, n.saturating_sub(prepaid), stats);
    }
}

/// A stream whose reads and writes are paced by a [`Shaper`].
///
/// Every read and write moves at most one chunk: the connection's effective rate, capped at
/// [`MAX_CHUNK_SIZE`]. A full chunk is charged after it went through and its delay is served
/// before the next I/O in the same direction. A smaller slice is charged up front, and
/// stays charged if its I/O fails. I/O errors are returned unchanged.
///
/// The connection is unregistered from the shaper on shutdown or when the stream is dropped.
pub struct ShapedStream<S> {
    inner: S,
    shaper: Arc<Shaper>,
    id: ConnectionId,
    read: Pacer,
    write: Pacer,
    stats: Arc<StreamStats>,
    registered: bool,
}

impl<S> ShapedStream<S> {
    /// Registers `inner` with `shaper` under its peer address and wraps it.
    pub fn new(inner: S, shaper: Arc<Shaper>) -> Result<Self, ShaperError>
    where
        S: PeerAddress,
    {
        let id = shaper.register_connection(&inner)?;
        Ok(Self::from_parts(inner, shaper, id))
    }

    /// Wraps `inner` as the connection `id`, which must already be registered with `shaper`.
    /// The stream takes over the registration.
    pub fn from_parts(inner: S, shaper: Arc<Shaper>, id: ConnectionId) -> Self {
        Self {
            inner,
            shaper,
            id,
            read: Pacer::new(Direction::Download),
            write: Pacer::new(Direction::Upload),
            stats: Arc::new(StreamStats::default()),
            registered: true,
        }
    }

    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn shaper(&self) -> &Arc<Shaper> {
        &self.shaper
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// The rate reads are currently held to, in bytes per second.
    pub fn download_capacity(&self) -> u64 {
        self.shaper.effective_capacity(self.id, Direction::Download)
    }

    /// The rate writes are currently held to, in bytes per second.
    pub fn upload_capacity(&self) -> u64 {
        self.shaper.effective_capacity(self.id, Direction::Upload)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutable access to the inner stream. I/O done through it bypasses the shaper.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    fn unregister(&mut self) {
        if std::mem::take(&mut self.registered) {
            self.shaper.unregister_connection(self.id);
            debug!(id = %self.id, rx = self.stats.bytes_rx(), tx = self.stats.bytes_tx(), "unregistered shaped stream");
        }
    }
}

impl ShapedStream<TcpStream> {
    /// Connects to `addr` and registers the connection with `shaper`.
    pub async fn connect<A: ToSocketAddrs>(addr: A, shaper: Arc<Shaper>) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(Self::new(stream, shaper)?)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl<S: PeerAddress> PeerAddress for ShapedStream<S> {
    fn peer_ip(&self) -> io::Result<std::net::IpAddr> {
        self.inner.peer_ip()
    }
}

impl<S> fmt::Debug for ShapedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapedStream")
            .field("id", &self.id)
            .field("download", &self.download_capacity())
            .field("upload", &self.upload_capacity())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<S> Drop for ShapedStream<S> {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl<S> AsyncRead for ShapedStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.read.poll_delay(cx));

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let len = ready!(this.read.poll_admit(cx, &this.shaper, this.id, buf.remaining(), &this.stats));

        let mut chunk = ReadBuf::new(buf.initialize_unfilled_to(len));
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))
            .map_err(|e| this.read.forfeit(e))?;
        let n = chunk.filled().len();
        buf.advance(n);

        this.stats.increment_rx(n);
        this.read.settle(&this.shaper, this.id, n, &this.stats);

        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for ShapedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.write.poll_delay(cx));

        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        let len = ready!(this.write.poll_admit(cx, &this.shaper, this.id, buf.len(), &this.stats));

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..len]))
            .map_err(|e| this.write.forfeit(e))?;

        this.stats.increment_tx(n);
        this.write.settle(&this.shaper, this.id, n, &this.stats);

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.unregister();

        let res = ready!(Pin::new(&mut this.inner).poll_shutdown(cx));
        if let Err(ref e) = res {
            warn!(id = %this.id, error = ?e, "failed to shut down shaped stream");
        }

        Poll::Ready(res)
    }
}
