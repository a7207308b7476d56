//! Client-role dial loop: connect, serve, redial after disconnect, and
//! prompt shutdown while dialing.

use fx_protocol::{Request, RequestType};
use fx_receiver::{ClientConfig, Receiver};
use fx_test_utils::{ReceiverPeer, bind_ephemeral};
use std::time::Duration;

#[tokio::test]
async fn client_connects_and_redials_after_disconnect() {
    let (listener, addr) = bind_ephemeral().await;
    let receiver = Receiver::connect(ClientConfig::new("127.0.0.1", addr.port()).unwrap());

    // First connection: the client is open immediately; keep-alives echo.
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client should dial in")
        .unwrap();
    let mut upstream = ReceiverPeer::new(stream);
    upstream
        .send(&Request::builder(RequestType::KeepAlive).build().unwrap())
        .await
        .unwrap();
    assert_eq!(upstream.expect().await.kind, RequestType::KeepAlive);

    // Drop the upstream side; the client must notice the EOF and redial.
    drop(upstream);
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client should redial after losing the connection")
        .unwrap();
    let mut upstream = ReceiverPeer::new(stream);
    upstream
        .send(&Request::builder(RequestType::KeepAlive).build().unwrap())
        .await
        .unwrap();
    assert_eq!(upstream.expect().await.kind, RequestType::KeepAlive);

    receiver.shutdown(None).await;
}

#[tokio::test]
async fn shutdown_interrupts_the_backoff_sleep() {
    // Bind then drop to find a port that refuses connections.
    let (listener, addr) = bind_ephemeral().await;
    drop(listener);

    let receiver = Receiver::connect(ClientConfig::new("127.0.0.1", addr.port()).unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    tokio::time::timeout(Duration::from_secs(1), receiver.shutdown(None))
        .await
        .expect("shutdown must interrupt the dial loop promptly");
}
