
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{closed_by_peer, roundtrip, wait_until, EchoUpstream, ProxyHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

#[tokio::test]
async fn ping_roundtrip_then_registry_drains() {
    let echo = EchoUpstream::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(echo.destination()).await;

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    timeout(Duration::from_millis(500), client.read_exact(&mut buf))
        .await
        .expect("echo should arrive quickly")
        .unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(proxy.active_relays(), 1);

    drop(client);
    assert!(
        wait_until(Duration::from_secs(1), || proxy.active_relays() == 0).await,
        "relay should deregister after the client disconnects"
    );

    proxy.controller.shutdown().await;
}

#[tokio::test]
async fn large_payload_is_transparent() {
    let echo = EchoUpstream::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(echo.destination()).await;

    let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    let send = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(5), reader.read_exact(&mut received))
        .await
        .expect("payload should come back")
        .unwrap();
    let _writer = send.await.unwrap();

    assert_eq!(received, expected);
    let stats = proxy.controller.stats();
    assert!(wait_until(Duration::from_secs(1), || {
        stats.bytes_to_upstream.load(Ordering::Relaxed) == expected.len() as u64
            && stats.bytes_from_upstream.load(Ordering::Relaxed) == expected.len() as u64
    })
    .await);

    proxy.controller.shutdown().await;
}

#[tokio::test]
async fn server_first_bytes_reach_client() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        stream.write_all(b"220 ready\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        let _ = stream.read(&mut buf).await;
    });

    let proxy = ProxyHandle::spawn(harness::destination_for(upstream_addr)).await;
    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();

    let mut greeting = [0u8; 11];
    timeout(Duration::from_secs(1), client.read_exact(&mut greeting))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&greeting, b"220 ready\r\n");

    proxy.controller.shutdown().await;
}

#[tokio::test]
async fn client_close_closes_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut buf = [0u8; 64];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
        let _ = closed_tx.send(());
    });

    let proxy = ProxyHandle::spawn(harness::destination_for(upstream_addr)).await;
    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || proxy.active_relays() == 1).await);

    drop(client);
    timeout(Duration::from_secs(1), closed_rx)
        .await
        .expect("upstream should see the relay close")
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || proxy.active_relays() == 0).await);

    proxy.controller.shutdown().await;
}

#[tokio::test]
async fn upstream_close_closes_client() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut buf = [0u8; 5];
        let _ = stream.read_exact(&mut buf).await;
        let _ = stream.write_all(b"bye").await;
        // Dropping the stream closes the upstream side.
    });

    let proxy = ProxyHandle::spawn(harness::destination_for(upstream_addr)).await;
    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut reply = [0u8; 3];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"bye");

    assert!(closed_by_peer(&mut client, Duration::from_secs(1)).await);
    assert!(wait_until(Duration::from_secs(1), || proxy.active_relays() == 0).await);

    proxy.controller.shutdown().await;
}

#[tokio::test]
async fn independent_clients_do_not_interfere() {
    let echo = EchoUpstream::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(echo.destination()).await;

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let addr = proxy.listen_addr;
            tokio::spawn(async move {
                let payload = format!("client-{i:02}");
                let reply = roundtrip(addr, payload.as_bytes(), payload.len())
                    .await
                    .unwrap();
                assert_eq!(reply, payload.as_bytes());
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(echo.connection_count(), 16);

    proxy.controller.shutdown().await;
}
