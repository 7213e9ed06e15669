//! End-to-end tests: the server on an ephemeral TCP port, driven by the
//! muxrpc client.

use bytes::Bytes;
use futures::future::join_all;
use muxrpc_client::{Client, ClientError, ConnectionConfig};
use muxrpc_server::{Callback, Server, ServerConfig, ServerError};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn echo(method: String, param: Bytes, callback: Callback) {
    if method == "echo" {
        let mut result = b"echo:".to_vec();
        result.extend_from_slice(&param);
        callback.success(result);
    } else {
        callback.failure(format!("unknown method: {}", method));
    }
}

struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let server = Server::new(config);
        server.register("hello", echo).unwrap();
        let server = Arc::new(server);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        Self { server, addr, task }
    }

    async fn client(&self) -> Client {
        let client = Client::with_addr(self.addr.to_string());
        client.connect().await.unwrap();
        client
    }

    async fn stop(self) {
        self.server.shutdown();
        self.task.await.unwrap().unwrap();
    }
}

async fn default_server() -> TestServer {
    TestServer::start(ServerConfig::default()).await
}

/// Stashes callbacks so calls to the `stall` service never complete.
fn stall(server: &Server) -> Arc<Mutex<Vec<Callback>>> {
    let stalled = Arc::new(Mutex::new(Vec::new()));
    let sink = stalled.clone();
    server
        .register("stall", move |_: String, _: Bytes, callback: Callback| {
            sink.lock().unwrap().push(callback);
        })
        .unwrap();
    stalled
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_hello_echo() {
    let server = default_server().await;
    let client = server.client().await;

    let result = client.call("hello.echo", "42").await.unwrap();
    assert_eq!(result, Bytes::from("echo:42"));

    let err = client.call("hello.shout", "42").await.unwrap_err();
    assert_eq!(err.remote_message(), Some("unknown method: shout"));
    assert!(client.is_connected());

    client.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_share_one_connection() {
    let server = default_server().await;
    let client = Arc::new(server.client().await);

    let tasks = (0..50).map(|task| {
        let client = client.clone();
        async move {
            for i in 0..20 {
                let param = format!("{}-{}", task, i);
                let result = client.call("hello.echo", param.clone()).await.unwrap();
                assert_eq!(result, Bytes::from(format!("echo:{}", param)));
            }
        }
    });
    join_all(tasks).await;

    assert_eq!(client.pending_count(), 0);
    assert_eq!(
        server
            .server
            .stats()
            .connections_total
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_service() {
    let server = default_server().await;
    let client = server.client().await;

    let err = client.call("nope.echo", "x").await.unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.remote_message(), Some("no such service: nope"));

    let result = client.call("hello.echo", "still here").await.unwrap();
    assert_eq!(result, Bytes::from("echo:still here"));
    server.stop().await;
}

#[tokio::test]
async fn test_method_names_may_contain_dots() {
    let server = default_server().await;
    server
        .server
        .register("meta", |method: String, _: Bytes, callback: Callback| {
            callback.success(method)
        })
        .unwrap();
    let client = server.client().await;

    let result = client.call("meta.a.b.c", Bytes::new()).await.unwrap();
    assert_eq!(result, Bytes::from("a.b.c"));
    server.stop().await;
}

#[tokio::test]
async fn test_registry_swap_on_live_connection() {
    let server = default_server().await;
    server
        .server
        .register("svc", |_: String, _: Bytes, cb: Callback| cb.success("A"))
        .unwrap();
    let client = server.client().await;
    assert_eq!(client.call("svc.m", "").await.unwrap(), Bytes::from("A"));

    let previous = server
        .server
        .register("svc", |_: String, _: Bytes, cb: Callback| cb.success("B"))
        .unwrap();
    assert!(previous.is_some());
    assert_eq!(client.call("svc.m", "").await.unwrap(), Bytes::from("B"));
    server.stop().await;
}

#[tokio::test]
async fn test_large_payload() {
    let server = default_server().await;
    let client = server.client().await;

    let param = vec![b'x'; 1024 * 1024];
    let result = client.call("hello.echo", param.clone()).await.unwrap();
    assert_eq!(result.len(), param.len() + 5);
    assert!(result.starts_with(b"echo:xxx"));
    server.stop().await;
}

#[tokio::test]
async fn test_call_timeout_keeps_connection() {
    let server = default_server().await;
    let _stalled = stall(&server.server);
    let client = server.client().await;

    let err = client
        .call_timeout("stall.forever", "", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout));
    assert_eq!(client.pending_count(), 0);

    let result = client.call("hello.echo", "after").await.unwrap();
    assert_eq!(result, Bytes::from("echo:after"));
    server.stop().await;
}

#[tokio::test]
async fn test_default_call_timeout() {
    let server = default_server().await;
    let _stalled = stall(&server.server);
    let client = Client::new(
        ConnectionConfig::new(server.addr.to_string())
            .with_call_timeout(Duration::from_millis(50)),
    );
    client.connect().await.unwrap();

    let err = client.call("stall.forever", "").await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout));
    server.stop().await;
}

#[tokio::test]
async fn test_server_shutdown_fails_pending_calls() {
    let server = default_server().await;
    let stalled = stall(&server.server);
    let client = Arc::new(server.client().await);

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.call("stall.forever", "").await }
    });
    wait_for(|| stalled.lock().unwrap().len() == 1).await;
    assert_eq!(client.pending_count(), 1);

    server.stop().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost));
    assert_eq!(client.pending_count(), 0);
    wait_for(|| !client.is_connected()).await;
}

#[tokio::test]
async fn test_reconnect_after_close() {
    let server = default_server().await;
    let client = server.client().await;
    assert_eq!(
        client.call("hello.echo", "1").await.unwrap(),
        Bytes::from("echo:1")
    );

    client.close();
    assert!(matches!(
        client.call("hello.echo", "2").await,
        Err(ClientError::NotConnected)
    ));

    client.connect().await.unwrap();
    assert_eq!(
        client.call("hello.echo", "3").await.unwrap(),
        Bytes::from("echo:3")
    );
    server.stop().await;
}
