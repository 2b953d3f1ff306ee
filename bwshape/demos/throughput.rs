//! Serves a stream of bytes through a shaped listener and reports what a few clients
//! actually receive.
//!
//! Usage: `cargo run --example throughput -- [server KB/s] [subnet KB/s] [clients]`

use std::time::{Duration, Instant};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{info, warn};

use bwshape::{units::KBps, Limit, ShapedListener, ShaperOptions};

const RUN_FOR: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut args = std::env::args().skip(1).map(|a| a.parse::<u64>().unwrap_or(0));
    let server = args.next().unwrap_or(200);
    let subnet = args.next().unwrap_or(50);
    let clients = args.next().unwrap_or(4) as usize;

    let options = ShaperOptions::default()
        .server_bandwidth(Limit::symmetric(server * KBps))
        .subnet_bandwidth("127.0.0.0/8", Limit::symmetric(subnet * KBps));
    let listener = ShapedListener::bind("127.0.0.1:0", &options).await.unwrap();
    let addr = listener.local_addr().unwrap();
    info!(%addr, server, subnet, "listening");

    tokio::spawn(async move {
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };

            tokio::spawn(async move {
                let chunk = vec![0xAB; 16 * 1024];
                while stream.write_all(&chunk).await.is_ok() {}
                info!(%peer, stats = ?stream.stats(), "client gone");
            });
        }
    });

    let handles: Vec<_> = (0..clients)
        .map(|i| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                let mut buf = vec![0u8; 64 * 1024];
                let mut total = 0;

                let start = Instant::now();
                while start.elapsed() < RUN_FOR {
                    match tokio::time::timeout(RUN_FOR.saturating_sub(start.elapsed()), stream.read(&mut buf)).await
                    {
                        Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                        Ok(Ok(n)) => total += n,
                    }
                }

                let rate = total as f64 / start.elapsed().as_secs_f64() / KBps as f64;
                info!(client = i, total, "received {rate:.1} KB/s");
                total
            })
        })
        .collect();

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    info!("aggregate {:.1} KB/s", total as f64 / RUN_FOR.as_secs_f64() / KBps as f64);
}
