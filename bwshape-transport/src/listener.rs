use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
};

use futures::ready;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

use bwshape_core::{OptionsError, Shaper, ShaperError, ShaperOptions, Subnet};

use crate::ShapedStream;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Invalid shaper options: {0}")]
    Options(#[from] OptionsError),
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
}

/// A TCP listener whose accepted connections are shaped by one shared [`Shaper`].
#[derive(Debug)]
pub struct ShapedListener {
    listener: TcpListener,
    shaper: Arc<Shaper>,
}

impl ShapedListener {
    /// Binds to `addr` and builds a shaper from `options`.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        options: &ShaperOptions,
    ) -> Result<Self, ListenerError> {
        let shaper = Shaper::with_options(options)?;
        let listener = TcpListener::bind(addr).await?;

        debug!(addr = ?listener.local_addr(), "shaped listener bound");
        Ok(Self::with_shaper(listener, Arc::new(shaper)))
    }

    /// Wraps an already bound listener.
    pub fn from_listener(listener: TcpListener, options: &ShaperOptions) -> Result<Self, OptionsError> {
        Ok(Self::with_shaper(listener, Arc::new(Shaper::with_options(options)?)))
    }

    /// Wraps an already bound listener with an existing shaper, which may be shared with
    /// other listeners.
    pub fn with_shaper(listener: TcpListener, shaper: Arc<Shaper>) -> Self {
        Self { listener, shaper }
    }

    /// Accepts the next connection and registers it with the shaper.
    pub async fn accept(&self) -> io::Result<(ShapedStream<TcpStream>, SocketAddr)> {
        let (io, addr) = self.listener.accept().await?;
        self.wrap(io, addr)
    }

    pub fn poll_accept(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<(ShapedStream<TcpStream>, SocketAddr)>> {
        let (io, addr) = ready!(self.listener.poll_accept(cx))?;
        Poll::Ready(self.wrap(io, addr))
    }

    fn wrap(&self, io: TcpStream, addr: SocketAddr) -> io::Result<(ShapedStream<TcpStream>, SocketAddr)> {
        io.set_nodelay(true)?;

        let id = self.shaper.register_connection(&addr)?;
        debug!(%addr, %id, "accepted shaped connection");

        Ok((ShapedStream::from_parts(io, Arc::clone(&self.shaper), id), addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Sets the server-wide limit. See [`Shaper::add_server_limit`].
    pub fn add_server_limit(&self, download: u64, upload: u64) -> Result<(), ShaperError> {
        self.shaper.add_server_limit(download, upload)
    }

    /// Sets the limit for peers inside `cidr`. See [`Shaper::add_subnet_limit`].
    pub fn add_subnet_limit(
        &self,
        cidr: &str,
        download: u64,
        upload: u64,
    ) -> Result<Subnet, ShaperError> {
        self.shaper.add_subnet_limit(cidr, download, upload)
    }

    pub fn shaper(&self) -> &Arc<Shaper> {
        &self.shaper
    }
}
