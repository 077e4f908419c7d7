//! End-to-end tests driving the server over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use lineward::config::Config;
use lineward::registry::ClientRegistry;
use lineward::resolver::{HostnameResolver, SystemResolver};
use lineward::server::{Server, ServerEvent, ServerState};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_test::assert_ok;

const SHUTDOWN_NOTICE: &str = "Server is shutting down";

fn test_config() -> Config {
    Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        resolve_hostnames: false,
        shutdown_notice: SHUTDOWN_NOTICE.to_string(),
        log_level: "info".to_string(),
    }
}

fn start_args() -> (Config, ClientRegistry, Arc<SystemResolver>) {
    (test_config(), ClientRegistry::new(), Arc::new(SystemResolver))
}

async fn wait_for<F>(cond: F, what: &str)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn next_event(events: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_echo_roundtrip_and_disconnect() {
    let (config, registry, resolver) = start_args();
    let server = Server::new(config, registry.clone(), resolver);
    assert_ok!(server.start().await);
    let addr = server.local_addr().unwrap();
    let mut events = server.subscribe();

    let stream = TcpStream::connect(addr).await.unwrap();
    wait_for(|| registry.len() == 1, "client registration").await;

    let joined = next_event(&mut events).await;
    let joined_id = match joined {
        ServerEvent::ClientJoined { client, .. } => client.id(),
        other => panic!("expected join event, got {other:?}"),
    };

    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(b"hello\n")
        .await
        .unwrap();

    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "Response received: hello\n");

    // A blank line is a valid message and gets a response too.
    reader.get_mut().write_all(b"\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "Response received: \n");

    drop(reader);
    wait_for(|| registry.is_empty(), "client removal").await;

    let left = next_event(&mut events).await;
    match left {
        ServerEvent::ClientLeft { client, .. } => {
            assert_eq!(client.id(), joined_id);
            assert!(client.is_disconnecting());
        }
        other => panic!("expected leave event, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_clients_are_independent() {
    let (config, registry, resolver) = start_args();
    let server = Server::new(config, registry.clone(), resolver);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let first = TcpStream::connect(addr).await.unwrap();
    let second = TcpStream::connect(addr).await.unwrap();
    wait_for(|| registry.len() == 2, "both registrations").await;

    let mut first = BufReader::new(first);
    let mut second = BufReader::new(second);
    let mut line = String::new();

    first.get_mut().write_all(b"one\n").await.unwrap();
    first.read_line(&mut line).await.unwrap();
    assert_eq!(line, "Response received: one\n");

    // Dropping the first client must not disturb the second session.
    drop(first);
    wait_for(|| registry.len() == 1, "first client removal").await;

    second.get_mut().write_all(b"two\n").await.unwrap();
    line.clear();
    second.read_line(&mut line).await.unwrap();
    assert_eq!(line, "Response received: two\n");

    server.stop().await;
}

#[tokio::test]
async fn test_stop_notifies_and_disconnects_all() {
    let (config, registry, resolver) = start_args();
    let server = Server::new(config, registry.clone(), resolver);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut peers = Vec::new();
    for _ in 0..3 {
        peers.push(TcpStream::connect(addr).await.unwrap());
    }
    wait_for(|| registry.len() == 3, "all registrations").await;

    server.stop().await;
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(registry.is_empty());

    for peer in peers {
        let mut reader = BufReader::new(peer);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, format!("{SHUTDOWN_NOTICE}\n"));

        // Then end-of-stream: the server force-disconnected the handle.
        line.clear();
        let n = reader.read_line(&mut line).await.unwrap();
        assert_eq!(n, 0);
    }

    // The listening socket is gone.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_broadcast_to_live_sessions() {
    let (config, registry, resolver) = start_args();
    let server = Server::new(config, registry.clone(), resolver);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let a = TcpStream::connect(addr).await.unwrap();
    let b = TcpStream::connect(addr).await.unwrap();
    wait_for(|| registry.len() == 2, "both registrations").await;

    registry.broadcast("attention all").await;

    for peer in [a, b] {
        let mut reader = BufReader::new(peer);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "attention all\n");
    }

    server.stop().await;
}

#[tokio::test]
async fn test_stub_resolver_names_client() {
    struct FixedResolver;

    impl HostnameResolver for FixedResolver {
        fn resolve(&self, _ip: std::net::IpAddr) -> std::io::Result<String> {
            Ok("peer.example.test".to_string())
        }
    }

    let mut config = test_config();
    config.resolve_hostnames = true;

    let registry = ClientRegistry::new();
    let server = Server::new(config, registry.clone(), Arc::new(FixedResolver));
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let _peer = TcpStream::connect(addr).await.unwrap();
    wait_for(|| registry.len() == 1, "client registration").await;

    let client = registry.snapshot().pop().unwrap();
    assert_eq!(client.host(), "peer.example.test");
    assert!(client.name().contains("peer.example.test"));

    server.stop().await;
}

#[tokio::test]
async fn test_failing_resolver_falls_back_to_ip() {
    struct FailingResolver;

    impl HostnameResolver for FailingResolver {
        fn resolve(&self, ip: std::net::IpAddr) -> std::io::Result<String> {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no name for {ip}"),
            ))
        }
    }

    let mut config = test_config();
    config.resolve_hostnames = true;

    let registry = ClientRegistry::new();
    let server = Server::new(config, registry.clone(), Arc::new(FailingResolver));
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    // Lookup failure must not cost the client its connection.
    let stream = TcpStream::connect(addr).await.unwrap();
    wait_for(|| registry.len() == 1, "client registration").await;

    let client = registry.snapshot().pop().unwrap();
    assert_eq!(client.host(), "127.0.0.1");
    assert!(client.is_connected());

    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(b"still here\n").await.unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line, "Response received: still here\n");

    server.stop().await;
}
