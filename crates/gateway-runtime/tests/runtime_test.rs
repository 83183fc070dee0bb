//! # Runtime Integration Tests
//!
//! Loads configuration the way the binary does, connects the gateway to the
//! in-memory broker and talks HTTP/1.1 to the served front end over TCP.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use gateway_runtime::{config::CONFIG_FILE_VAR, load_config_with};
use rpc_gateway::RpcGateway;
use shared_bus::{ExchangeKind, InMemoryBroker, MessageProperties};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

fn spawn_echo_worker(broker: &InMemoryBroker) {
    broker.declare_exchange("echoRequest", ExchangeKind::Direct);
    broker.declare_exchange("echoResponse", ExchangeKind::Direct);
    broker.declare_queue("echo-worker");
    broker.bind("echo-worker", "echoRequest", "").unwrap();

    let mut requests = broker.subscribe("echo-worker").unwrap();
    let broker = broker.clone();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let props = request.properties;
            let mut properties = MessageProperties::new();
            properties.correlation_id = props.correlation_id;
            properties.content_type = props.content_type;
            let _ = broker.publish(
                "echoResponse",
                &props.reply_to.unwrap_or_default(),
                request.body,
                properties,
            );
        }
    });
}

/// Send one request with `Connection: close` and return the raw response.
async fn http(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response within timeout")
        .unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn test_configured_gateway_serves_http() {
    // Arrange: config file on an ephemeral port, env override for the timeout
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(br#"{ "http": { "port": 0 } }"#).unwrap();
    let path = file.path().to_str().unwrap().to_string();
    let config = load_config_with(move |key| match key {
        CONFIG_FILE_VAR => Some(path.clone()),
        "RPC_TIMEOUT_MS" => Some("2000".to_string()),
        _ => None,
    })
    .unwrap();
    assert_eq!(config.timeouts.rpc, Duration::from_secs(2));

    let broker = InMemoryBroker::new();
    spawn_echo_worker(&broker);
    let gateway = Arc::new(RpcGateway::connect(config, &broker).await.unwrap());
    let listener = gateway.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(Arc::clone(&gateway).serve(listener, async move {
        let _ = stop_rx.await;
    }));

    // Act
    let health = http(
        addr,
        "GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let echo = http(
        addr,
        "POST /rpc/echo HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\n\
         Content-Length: 5\r\nConnection: close\r\n\r\nhello",
    )
    .await;
    let missing = http(
        addr,
        "POST /rpc/missing HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    // Assert
    assert!(health.starts_with("HTTP/1.1 200"), "{}", health);
    assert!(health.ends_with("OK"));

    assert!(echo.starts_with("HTTP/1.1 200"), "{}", echo);
    assert!(echo.contains("text/plain"));
    assert!(echo.ends_with("hello"));

    assert!(missing.starts_with("HTTP/1.1 404"), "{}", missing);
    assert!(missing.contains("missingRequest"));

    stop_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server stops")
        .unwrap()
        .unwrap();
    gateway.shutdown().await.unwrap();
}
