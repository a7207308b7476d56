//! Client-role session tests against a scripted game peer.

use fx_protocol::auth::verify_password;
use fx_protocol::{PacketType, Request, RequestType, Response, ResultType, TriState};
use fx_sender::{Sender, SenderClientConfig, SenderOptions, SendError, TrackerError};
use fx_test_utils::{ReceiverPeer, bind_ephemeral};
use std::time::Duration;
use tokio::net::TcpListener;

async fn dial(listener: &TcpListener, options: SenderOptions) -> (Sender, ReceiverPeer) {
    let port = listener.local_addr().unwrap().port();
    let sender = Sender::connect_with(
        SenderClientConfig::new("127.0.0.1", port, "password").unwrap(),
        options,
    );
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("sender should dial in")
        .unwrap();
    (sender, ReceiverPeer::new(stream))
}

async fn wait_open(sender: &Sender) {
    for _ in 0..200 {
        if let Some(connection) = sender.connection().await {
            if connection.is_open() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sender connection never opened");
}

#[tokio::test]
async fn challenged_client_presents_the_hashed_secret() {
    let (listener, _addr) = bind_ephemeral().await;
    let (sender, mut game) = dial(&listener, SenderOptions::default()).await;

    game.send(&Response::login_challenge()).await.unwrap();
    let login = game.expect().await;
    assert_eq!(login.kind, RequestType::Login);
    assert!(verify_password("password", login.password.as_deref().unwrap()));

    game.send(&Response::login_success()).await.unwrap();
    wait_open(&sender).await;

    // Requests flow once open.
    let mut responses = sender
        .send_request(Request::builder(RequestType::Start).effect("kill").viewer("qixils"))
        .await
        .unwrap();
    let request = game.expect().await;
    assert_eq!(request.kind, RequestType::Start);
    assert_eq!(request.effect.as_deref(), Some("kill"));
    assert!(request.id > 0);

    let reply = Response::builder(PacketType::EffectResult)
        .id(request.id)
        .result(ResultType::Success)
        .build()
        .unwrap();
    game.send(&reply).await.unwrap();
    let received = responses.next().await.unwrap().unwrap();
    assert_eq!(received.result, Some(ResultType::Success));
    assert!(responses.next().await.is_none());
    assert_eq!(sender.effect_available("kill").await, TriState::True);
}

#[tokio::test]
async fn effect_requests_fail_before_login_completes() {
    let (listener, _addr) = bind_ephemeral().await;
    let (sender, mut game) = dial(&listener, SenderOptions::default()).await;
    game.send(&Response::login_challenge()).await.unwrap();
    let _login = game.expect().await;

    // Still authenticating: the stream fails without touching the wire.
    let mut responses = sender
        .send_request(Request::builder(RequestType::Start).effect("kill").viewer("v"))
        .await
        .unwrap();
    assert_eq!(
        responses.next().await.unwrap(),
        Err(TrackerError::NotAccepting)
    );
    assert!(responses.next().await.is_none());
}

#[tokio::test]
async fn unchallenged_peer_counts_as_open() {
    let (listener, _addr) = bind_ephemeral().await;
    let (sender, mut game) = dial(&listener, SenderOptions::default()).await;

    game.send(&Response::keep_alive()).await.unwrap();
    wait_open(&sender).await;
}

#[tokio::test]
async fn keep_alive_pings_on_the_configured_cadence() {
    let (listener, _addr) = bind_ephemeral().await;
    let options = SenderOptions {
        keep_alive_interval: Some(Duration::from_millis(100)),
        ..SenderOptions::default()
    };
    let (_sender, mut game) = dial(&listener, options).await;
    game.send(&Response::keep_alive()).await.unwrap();

    let ping = game.expect().await;
    assert_eq!(ping.kind, RequestType::KeepAlive);
    assert_eq!(ping.id, 0, "unsolicited pings carry id 0");
    let again = game.expect().await;
    assert_eq!(again.kind, RequestType::KeepAlive);
}

#[tokio::test]
async fn known_unavailable_effects_are_rejected_synchronously() {
    let (listener, _addr) = bind_ephemeral().await;
    let (sender, mut game) = dial(&listener, SenderOptions::default()).await;
    game.send(&Response::keep_alive()).await.unwrap();
    wait_open(&sender).await;

    let mut responses = sender
        .send_request(Request::builder(RequestType::Start).effect("cursed").viewer("v"))
        .await
        .unwrap();
    let request = game.expect().await;
    let reply = Response::builder(PacketType::EffectResult)
        .id(request.id)
        .result(ResultType::Unavailable)
        .build()
        .unwrap();
    game.send(&reply).await.unwrap();
    assert_eq!(
        responses.next().await.unwrap().unwrap().result,
        Some(ResultType::Unavailable)
    );
    assert!(responses.next().await.is_none());

    let err = sender
        .send_request(Request::builder(RequestType::Start).effect("cursed").viewer("v"))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::EffectUnavailable(effect) if effect == "cursed"));
}

#[tokio::test]
async fn overridden_initial_timeout_fails_silent_requests() {
    let (listener, _addr) = bind_ephemeral().await;
    let options = SenderOptions {
        initial_response_timeout: Some(Duration::from_millis(200)),
        ..SenderOptions::default()
    };
    let (sender, mut game) = dial(&listener, options).await;
    game.send(&Response::keep_alive()).await.unwrap();
    wait_open(&sender).await;

    let mut responses = sender
        .send_request(Request::builder(RequestType::Start).effect("kill").viewer("v"))
        .await
        .unwrap();
    let _ignored = game.expect().await;
    let failure = tokio::time::timeout(Duration::from_secs(5), responses.next())
        .await
        .expect("timeout should fire")
        .unwrap();
    assert_eq!(failure, Err(TrackerError::Timeout));
}

#[tokio::test]
async fn shutdown_drains_in_flight_packets_then_fails_the_rest() {
    let (listener, _addr) = bind_ephemeral().await;
    let options = SenderOptions {
        drain_window: Duration::from_millis(200),
        initial_response_timeout: None,
        ..SenderOptions::default()
    };
    let (sender, mut game) = dial(&listener, options).await;
    game.send(&Response::keep_alive()).await.unwrap();
    wait_open(&sender).await;

    let mut resolving = sender
        .send_request(Request::builder(RequestType::Start).effect("kill").viewer("v"))
        .await
        .unwrap();
    let mut waiting = sender
        .send_request(Request::builder(RequestType::Stop).effect("kill").viewer("v"))
        .await
        .unwrap();
    let first = game.expect().await;
    let _second = game.expect().await;

    let shutdown = tokio::spawn(async move {
        sender.shutdown().await;
        sender
    });
    // Reply to the first request inside the drain window.
    let reply = Response::builder(PacketType::EffectResult)
        .id(first.id)
        .result(ResultType::Success)
        .build()
        .unwrap();
    game.send(&reply).await.unwrap();

    let resolved = resolving.next().await.unwrap().unwrap();
    assert_eq!(resolved.result, Some(ResultType::Success));
    assert!(resolving.next().await.is_none());

    let _sender = shutdown.await.unwrap();
    assert_eq!(waiting.next().await.unwrap(), Err(TrackerError::Shutdown));
    assert!(waiting.next().await.is_none());
}
