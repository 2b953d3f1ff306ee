use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use futures::future::join_all;
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use bwshape::{units::KBps, Limit, ShapedListener, ShaperOptions, SubnetMode};

/// Accepts `clients` connections and sends `payload` to each of them.
fn serve(listener: ShapedListener, clients: usize, payload: Vec<u8>) {
    tokio::spawn(async move {
        for _ in 0..clients {
            let (mut stream, addr) = listener.accept().await.unwrap();
            let payload = payload.clone();

            tokio::spawn(async move {
                stream.write_all(&payload).await.unwrap();
                stream.shutdown().await.unwrap();
                tracing::debug!(%addr, stats = ?stream.stats(), "sent payload");
            });
        }
    });
}

/// Connects, reads `len` bytes and returns how long that took.
async fn fetch(addr: SocketAddr, len: usize) -> Duration {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let start = Instant::now();

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();

    start.elapsed()
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill(&mut payload[..]);
    payload
}

#[tokio::test]
async fn each_connection_gets_the_subnet_rate() {
    let _ = tracing_subscriber::fmt::try_init();

    const CLIENTS: usize = 20;
    let options = ShaperOptions::default()
        .subnet_bandwidth("127.0.0.1/26", Limit::symmetric(10 * KBps))
        .subnet_mode(SubnetMode::PerConnection);
    let listener = ShapedListener::bind("127.0.0.1:0", &options).await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Four 10 KiB chunks: the first goes out at once, each of the others a second later.
    let len = 40 * KBps as usize;
    serve(listener, CLIENTS, random_payload(len));

    let elapsed = join_all((0..CLIENTS).map(|_| fetch(addr, len))).await;

    let expected = Duration::from_secs(3);
    for e in elapsed {
        assert!(e >= expected.mul_f64(0.95), "{e:?}");
        assert!(e <= expected.mul_f64(1.05), "{e:?}");
    }
}

#[tokio::test]
async fn pooled_connections_share_the_subnet_rate() {
    let _ = tracing_subscriber::fmt::try_init();

    let options =
        ShaperOptions::default().subnet_bandwidth("127.0.0.0/8", Limit::symmetric(10 * KBps));
    let listener = ShapedListener::bind("127.0.0.1:0", &options).await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Two chunks per client. Alone, a client would finish after a second. Sharing the
    // pool, the first chunks put it two seconds in debt: one client gets its second chunk
    // after a second, the other after two.
    let len = 20 * KBps as usize;
    serve(listener, 2, random_payload(len));

    let elapsed = join_all((0..2).map(|_| fetch(addr, len))).await;
    let fastest = elapsed.iter().min().copied().unwrap();
    let slowest = elapsed.iter().max().copied().unwrap();

    assert!(fastest >= Duration::from_millis(950), "{fastest:?}");
    assert!(fastest <= Duration::from_millis(1100), "{fastest:?}");
    assert!(slowest >= Duration::from_millis(1900), "{slowest:?}");
    assert!(slowest <= Duration::from_millis(2100), "{slowest:?}");
}

#[tokio::test]
async fn server_rate_binds_below_subnet_rate() {
    let _ = tracing_subscriber::fmt::try_init();

    const CLIENTS: usize = 5;
    let options = ShaperOptions::default()
        .server_bandwidth(Limit::symmetric(100 * KBps))
        .subnet_bandwidth("127.0.0.1/26", Limit::symmetric(1024 * KBps));
    let listener = ShapedListener::bind("127.0.0.1:0", &options).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shaper = std::sync::Arc::clone(listener.shaper());

    // Each payload fits in one chunk, so it is paid for before it is sent. The server pool
    // covers all five payloads in two seconds. The subnet alone would take a fifth of that.
    let len = 40 * KBps as usize;
    serve(listener, CLIENTS, random_payload(len));

    let elapsed = join_all((0..CLIENTS).map(|_| fetch(addr, len))).await;
    let slowest = elapsed.into_iter().max().unwrap();

    assert!(slowest >= Duration::from_millis(1900), "{slowest:?}");
    assert!(slowest <= Duration::from_millis(2100), "{slowest:?}");

    // Every stream shuts down once its payload is out.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(shaper.connections(), 0);
}

#[tokio::test]
async fn subnet_rate_binds_below_server_rate() {
    let _ = tracing_subscriber::fmt::try_init();

    const CLIENTS: usize = 3;
    let options = ShaperOptions::default()
        .server_bandwidth(Limit::symmetric(1024 * KBps))
        .subnet_bandwidth("127.0.0.1/26", Limit::symmetric(10 * KBps))
        .subnet_mode(SubnetMode::PerConnection);
    let listener = ShapedListener::bind("127.0.0.1:0", &options).await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Three 10 KiB chunks per client. Under the server rate alone this takes a few
    // milliseconds.
    let len = 30 * KBps as usize;
    serve(listener, CLIENTS, random_payload(len));

    let elapsed = join_all((0..CLIENTS).map(|_| fetch(addr, len))).await;

    let expected = Duration::from_secs(2);
    for e in elapsed {
        assert!(e >= expected.mul_f64(0.95), "{e:?}");
        assert!(e <= expected.mul_f64(1.05), "{e:?}");
    }
}

#[tokio::test]
async fn continuous_read_matches_download_rate() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let payload = random_payload(64 * KBps as usize);
        while stream.write_all(&payload).await.is_ok() {}
    });

    let shaper = std::sync::Arc::new(
        bwshape::Shaper::with_options(
            &ShaperOptions::default().server_bandwidth(Limit::new(10 * KBps, 10 * KBps)),
        )
        .unwrap(),
    );
    let mut stream = bwshape::ShapedStream::connect(addr, shaper).await.unwrap();

    // Reads smaller than a chunk are paid for up front, one every 50ms.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut buf = [0u8; 512];
    let mut total = 0;
    while let Ok(res) = tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
        total += res.unwrap();
    }

    let expected = 20.0 * KBps as f64;
    let total = total as f64;
    assert!(total >= expected * 0.95, "{total}");
    assert!(total <= expected * 1.05, "{total}");
}

#[tokio::test]
async fn client_side_streams_are_shaped() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let len = 30 * KBps as usize;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    });

    let shaper = std::sync::Arc::new(
        bwshape::Shaper::with_options(
            &ShaperOptions::default().server_bandwidth(Limit::new(1024 * KBps, 10 * KBps)),
        )
        .unwrap(),
    );
    let mut stream = bwshape::ShapedStream::connect(addr, shaper).await.unwrap();

    let payload = random_payload(len);
    let start = Instant::now();
    stream.write_all(&payload).await.unwrap();
    let received = server.await.unwrap();

    // Three chunks with a second between each.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2100), "{elapsed:?}");
    assert_eq!(received, payload);
    assert_eq!(stream.stats().bytes_tx(), len as u64);
}
