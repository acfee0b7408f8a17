//! Protocol-upgrade tests over real sockets: a raw client negotiates an
//! upgrade through the front server and exchanges bytes with a mock backend
//! on the switched connection.

mod common;

use common::{read_head, spawn_proxy, start_raw_backend, start_upgrade_backend};
use onehop::{Forwarder, SingleHostConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const UPGRADE_REQUEST: &str =
    "GET /sock HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n";

async fn proxy_for(backend: std::net::SocketAddr) -> std::net::SocketAddr {
    let forwarder = Forwarder::single_host(
        &format!("http://{backend}"),
        SingleHostConfig::default(),
    )
    .unwrap();
    spawn_proxy(forwarder).await
}

#[tokio::test]
async fn test_upgrade_tunnel_carries_bytes_both_ways() {
    let backend = start_upgrade_backend("echo").await;
    let proxy = proxy_for(backend).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(head.to_ascii_lowercase().contains("upgrade: echo"), "{head}");

    // The connection now speaks the switched protocol; the backend echoes.
    stream.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");

    stream.write_all(b"second frame").await.unwrap();
    let mut reply = [0u8; 12];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"second frame");
}

#[tokio::test]
async fn test_backend_refusing_upgrade_answers_502() {
    let backend = start_raw_backend(
        "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nregular",
    )
    .await;
    let proxy = proxy_for(backend).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
}

#[tokio::test]
async fn test_upgrade_token_mismatch_answers_502() {
    // Backend switches to a protocol the client did not ask for.
    let backend = start_upgrade_backend("other").await;
    let proxy = proxy_for(backend).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
}
