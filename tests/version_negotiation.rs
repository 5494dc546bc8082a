//! Handshake version negotiation between mixed-version peers.

use std::net::SocketAddr;
use std::time::Duration;

use tunnel_proxy::events::ConnectorEvent;
use tunnel_proxy::protocol::ProtocolVersion;

mod common;

#[tokio::test]
async fn test_settles_on_older_version() {
    let target_addr: SocketAddr = "127.0.0.1:29301".parse().unwrap();
    let public_addr: SocketAddr = "127.0.0.1:29302".parse().unwrap();
    let registration_addr: SocketAddr = "127.0.0.1:29303".parse().unwrap();

    common::start_target(target_addr).await;
    // Router only speaks the single-exchange protocol; the connector
    // offers both and must settle on the older one.
    let (shutdown, registry) =
        common::start_router(public_addr, registration_addr, vec![ProtocolVersion::V1]).await;
    let connector = common::start_connector(
        registration_addr,
        target_addr,
        1,
        vec![ProtocolVersion::V2, ProtocolVersion::V1],
    );

    common::wait_for_sockets(&registry, 1).await;

    let info = registry.collect_info();
    assert_eq!(
        info.routes["example"]["example"].sockets[0].version,
        "tunnel-v1"
    );

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let res = client
        .get(format!("http://{public_addr}/example/hello"))
        .send()
        .await
        .expect("Router unreachable");
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "Hi there!");

    shutdown.trigger();
    connector.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_no_common_version_never_registers() {
    let target_addr: SocketAddr = "127.0.0.1:29311".parse().unwrap();
    let public_addr: SocketAddr = "127.0.0.1:29312".parse().unwrap();
    let registration_addr: SocketAddr = "127.0.0.1:29313".parse().unwrap();

    common::start_target(target_addr).await;
    let (shutdown, registry) =
        common::start_router(public_addr, registration_addr, vec![ProtocolVersion::V1]).await;
    let connector = common::start_connector(
        registration_addr,
        target_addr,
        1,
        vec![ProtocolVersion::V2],
    );
    let mut events = connector.events();

    let error = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ConnectorEvent::SocketConnectionError { error, .. }) = events.recv().await {
                break error;
            }
        }
    })
    .await
    .expect("expected a connection error event");
    assert!(
        error.contains("400"),
        "handshake should be rejected before upgrade, got: {error}"
    );
    assert!(registry.snapshot("example").is_empty());

    shutdown.trigger();
    connector.stop(Duration::from_secs(1)).await;
}
