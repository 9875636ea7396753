#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use chatd::client::{ChatStream, Client};
use chatd::config::ServerConfig;
use chatd::protocol::Envelope;
use chatd::registry::Registry;
use chatd::router::Router;
use chatd::server::Server;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A server running on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub router: Router,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub fn registry(&self) -> &Registry {
        self.router.registry()
    }

    /// Cancel the server and wait for it and its sessions to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop within 5s")
            .expect("server task panicked")
            .expect("server returned an error");
    }
}

pub async fn start_test_server() -> TestServer {
    start_test_server_with(ServerConfig::default()).await
}

pub async fn start_test_server_with(config: ServerConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::from_listener(listener, &config, None);
    let addr = server.local_addr().unwrap();
    let router = server.router().clone();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(server.serve(cancel.clone()));
    TestServer {
        addr,
        router,
        cancel,
        handle,
    }
}

/// Poll until `name` appears in the registry.
pub async fn wait_registered(registry: &Registry, name: &str) {
    for _ in 0..200 {
        if registry.contains(name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{name} was never registered");
}

/// Poll until `name` is gone from the registry.
pub async fn wait_released(registry: &Registry, name: &str) {
    for _ in 0..200 {
        if !registry.contains(name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{name} was never released");
}

/// Connect, register, and wait until the server has admitted the name.
pub async fn join(server: &TestServer, name: &str) -> ChatStream {
    let stream = Client::connect(server.addr)
        .await
        .unwrap()
        .register(name)
        .await
        .unwrap();
    wait_registered(server.registry(), name).await;
    stream
}

/// Receive one message, failing the test after two seconds.
pub async fn recv_within(stream: &mut ChatStream) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("receive failed")
        .expect("stream ended")
}

/// Assert that nothing arrives for a short while.
pub async fn assert_silent(stream: &mut ChatStream) {
    let result = tokio::time::timeout(Duration::from_millis(150), stream.recv()).await;
    assert!(result.is_err(), "expected no message, got {:?}", result);
}
