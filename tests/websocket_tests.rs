//! End-to-end WebSocket exchanges through registered tunnel sockets.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tunnel_proxy::protocol::ProtocolVersion;

mod common;

#[tokio::test]
async fn test_websocket_echo_through_tunnel() {
    let target_addr: SocketAddr = "127.0.0.1:29201".parse().unwrap();
    let public_addr: SocketAddr = "127.0.0.1:29202".parse().unwrap();
    let registration_addr: SocketAddr = "127.0.0.1:29203".parse().unwrap();

    common::start_target(target_addr).await;
    let (shutdown, registry) = common::start_router(
        public_addr,
        registration_addr,
        vec![ProtocolVersion::V2, ProtocolVersion::V1],
    )
    .await;
    let connector = common::start_connector(
        registration_addr,
        target_addr,
        2,
        vec![ProtocolVersion::V2, ProtocolVersion::V1],
    );

    common::wait_for_sockets(&registry, 2).await;

    let (mut client, _) = connect_async(format!("ws://{public_addr}/example/echo"))
        .await
        .expect("WebSocket upgrade through the router failed");

    client
        .send(Message::Text("hello world!".into()))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for echo")
        .expect("socket closed before echo")
        .unwrap();
    assert_eq!(
        reply,
        Message::Text("ECHO BACK: hello world!".into()),
        "echo should round-trip through both tunnel hops"
    );

    client.send(Message::Close(None)).await.unwrap();

    shutdown.trigger();
    connector.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_websocket_echo_on_single_exchange_protocol() {
    let target_addr: SocketAddr = "127.0.0.1:29211".parse().unwrap();
    let public_addr: SocketAddr = "127.0.0.1:29212".parse().unwrap();
    let registration_addr: SocketAddr = "127.0.0.1:29213".parse().unwrap();

    common::start_target(target_addr).await;
    let (shutdown, registry) =
        common::start_router(public_addr, registration_addr, vec![ProtocolVersion::V1]).await;
    let connector = common::start_connector(
        registration_addr,
        target_addr,
        2,
        vec![ProtocolVersion::V1],
    );

    common::wait_for_sockets(&registry, 2).await;

    let (mut client, _) = connect_async(format!("ws://{public_addr}/example/echo"))
        .await
        .expect("WebSocket upgrade through the router failed");

    for msg in ["one", "two"] {
        client.send(Message::Text(msg.into())).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for echo")
            .expect("socket closed before echo")
            .unwrap();
        assert_eq!(reply, Message::Text(format!("ECHO BACK: {msg}").into()));
    }

    client.send(Message::Close(None)).await.unwrap();

    shutdown.trigger();
    connector.stop(Duration::from_secs(1)).await;
}
