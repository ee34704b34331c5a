
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use harness::{
    closed_by_peer, dead_addr, destination_for, fast_settings, roundtrip, wait_until,
    ProxyHandle, StalledUpstream,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn connection_is_accepted_then_closed() {
    let dead = dead_addr().await;
    let proxy = ProxyHandle::spawn(destination_for(dead)).await;

    let mut client = TcpStream::connect(proxy.listen_addr)
        .await
        .expect("proxy accepts even when the upstream is down");
    assert!(closed_by_peer(&mut client, Duration::from_secs(1)).await);

    let stats = proxy.controller.stats();
    assert!(wait_until(Duration::from_secs(1), || {
        stats.upstream_failed.load(Ordering::Relaxed) == 1
    })
    .await);
    assert!(wait_until(Duration::from_secs(1), || proxy.active_relays() == 0).await);

    proxy.controller.shutdown().await;
}

#[tokio::test]
async fn listener_keeps_accepting_after_upstream_failure() {
    let dead = dead_addr().await;
    let proxy = ProxyHandle::spawn(destination_for(dead)).await;

    for _ in 0..3 {
        let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
        let _ = client.write_all(b"anyone there?").await;
        assert!(closed_by_peer(&mut client, Duration::from_secs(1)).await);
    }

    let stats = proxy.controller.stats();
    assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 3);
    assert!(wait_until(Duration::from_secs(1), || {
        stats.upstream_failed.load(Ordering::Relaxed) == 3
    })
    .await);

    proxy.controller.shutdown().await;
}

#[tokio::test]
async fn relaying_resumes_once_upstream_appears() {
    let dead = dead_addr().await;
    let proxy = ProxyHandle::spawn(destination_for(dead)).await;

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    assert!(closed_by_peer(&mut client, Duration::from_secs(1)).await);

    let upstream = TcpListener::bind(dead).await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = upstream.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    let reply = roundtrip(proxy.listen_addr, b"back", 4).await.unwrap();
    assert_eq!(reply, b"back");

    proxy.controller.shutdown().await;
}

#[tokio::test]
async fn connect_timeout_closes_client() {
    let stalled = StalledUpstream::spawn().await.unwrap();
    let mut settings = fast_settings();
    settings.connect_timeout = Duration::from_millis(300);
    let proxy = ProxyHandle::spawn_with(stalled.destination(), settings).await;

    let started = Instant::now();
    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    assert!(closed_by_peer(&mut client, Duration::from_secs(2)).await);
    assert!(
        started.elapsed() >= Duration::from_millis(250),
        "client closed before the connect timeout elapsed"
    );

    let stats = proxy.controller.stats();
    assert!(wait_until(Duration::from_secs(1), || {
        stats.upstream_failed.load(Ordering::Relaxed) == 1
    })
    .await);
    assert_eq!(stats.upstream_connected.load(Ordering::Relaxed), 0);
    assert!(wait_until(Duration::from_secs(1), || proxy.active_relays() == 0).await);

    proxy.controller.shutdown().await;
}
