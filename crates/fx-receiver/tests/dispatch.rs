//! Request routing: handler registration, global checks, unknown effects,
//! error translation, and timed effects driven end to end.

use fx_protocol::{PacketType, Request, RequestType, ResultType};
use fx_receiver::{
    CheckResult, HandlerError, Receiver, RegisterError, ServerConfig, TimedEffectScheduler,
};
use fx_test_utils::SenderPeer;
use std::net::SocketAddr;
use std::time::Duration;

async fn serve() -> (Receiver, SocketAddr) {
    let receiver = Receiver::serve(ServerConfig {
        port: 0,
        password: "password".to_owned(),
    })
    .await
    .expect("bind");
    let port = receiver.local_addr().unwrap().port();
    (receiver, SocketAddr::from(([127, 0, 0, 1], port)))
}

fn start_request(id: u32, effect: &str) -> Request {
    Request::builder(RequestType::Start)
        .id(id)
        .effect(effect)
        .viewer("tester")
        .build()
        .unwrap()
}

#[tokio::test]
async fn duplicate_handlers_are_rejected() {
    let (receiver, _addr) = serve().await;
    receiver
        .register_effect("kill", |req| {
            Ok(req.response().result(ResultType::Success).build()?)
        })
        .unwrap();
    let err = receiver
        .register_effect("kill", |req| {
            Ok(req.response().result(ResultType::Success).build()?)
        })
        .unwrap_err();
    assert_eq!(err, RegisterError::Duplicate("kill".to_owned()));
}

#[tokio::test]
async fn unknown_effect_is_unavailable_and_hidden() {
    let (_receiver, addr) = serve().await;
    let mut peer = SenderPeer::connect(addr).await.unwrap();
    peer.login("password").await;

    peer.send(&start_request(1, "unknown")).await.unwrap();
    let result = peer.expect().await;
    assert_eq!(result.packet, PacketType::EffectResult);
    assert_eq!(result.id, 1);
    assert_eq!(result.result, Some(ResultType::Unavailable));

    let status = peer.expect().await;
    assert_eq!(status.packet, PacketType::EffectStatus);
    assert_eq!(status.result, Some(ResultType::NotVisible));
    assert!(status.ids.as_ref().unwrap().contains("unknown"));
}

#[tokio::test]
async fn sync_handler_response_is_written_back() {
    let (receiver, addr) = serve().await;
    receiver
        .register_effect("kill", |req| {
            Ok(req
                .response()
                .result(ResultType::Success)
                .message("Effect applied successfully")
                .build()?)
        })
        .unwrap();
    let mut peer = SenderPeer::connect(addr).await.unwrap();
    peer.login("password").await;

    peer.send(&start_request(3, "KILL")).await.unwrap();
    let result = peer.expect().await;
    assert_eq!(result.id, 3);
    assert_eq!(result.result, Some(ResultType::Success));
    assert_eq!(result.message.as_deref(), Some("Effect applied successfully"));
}

#[tokio::test]
async fn global_check_disallow_fails_the_request() {
    let (receiver, addr) = serve().await;
    receiver
        .register_effect("kill", |req| {
            Ok(req.response().result(ResultType::Success).build()?)
        })
        .unwrap();
    receiver.add_global_check(|_req| CheckResult::Disallow);
    let mut peer = SenderPeer::connect(addr).await.unwrap();
    peer.login("password").await;

    peer.send(&start_request(4, "kill")).await.unwrap();
    let result = peer.expect().await;
    assert_eq!(result.result, Some(ResultType::Failure));
    assert_eq!(result.message.as_deref(), Some("The game is unavailable"));
}

#[tokio::test]
async fn handler_errors_translate_to_failure() {
    let (receiver, addr) = serve().await;
    receiver
        .register_effect("bomb", |_req| Err(HandlerError::msg("boom")))
        .unwrap();
    receiver
        .register_effect("solo", |_req| Err(HandlerError::NoApplicableTarget))
        .unwrap();
    let mut peer = SenderPeer::connect(addr).await.unwrap();
    peer.login("password").await;

    peer.send(&start_request(5, "bomb")).await.unwrap();
    let result = peer.expect().await;
    assert_eq!(result.result, Some(ResultType::Failure));
    assert_eq!(
        result.message.as_deref(),
        Some("Request handler threw an exception")
    );

    peer.send(&start_request(6, "solo")).await.unwrap();
    let result = peer.expect().await;
    assert_eq!(result.result, Some(ResultType::Failure));
    assert_eq!(result.message.as_deref(), Some("Streamer(s) unavailable"));
}

#[tokio::test]
async fn async_handler_emits_out_of_band() {
    let (receiver, addr) = serve().await;
    receiver
        .register_async_effect("drip", |req| async move {
            let queued = req.response().result(ResultType::Queue).build()?;
            req.respond(&queued).await.map_err(|e| HandlerError::msg(e.to_string()))?;
            let done = req.response().result(ResultType::Success).build()?;
            req.respond(&done).await.map_err(|e| HandlerError::msg(e.to_string()))?;
            Ok(())
        })
        .unwrap();
    let mut peer = SenderPeer::connect(addr).await.unwrap();
    peer.login("password").await;

    peer.send(&start_request(7, "drip")).await.unwrap();
    assert_eq!(peer.expect().await.result, Some(ResultType::Queue));
    let last = peer.expect().await;
    assert_eq!(last.result, Some(ResultType::Success));
    assert!(last.is_terminating());
}

#[tokio::test]
async fn timed_effects_queue_per_group_end_to_end() {
    let (receiver, addr) = serve().await;
    let scheduler: TimedEffectScheduler = receiver.scheduler().clone();
    receiver
        .register_async_effect("disable_jump", move |req| {
            let scheduler = scheduler.clone();
            async move {
                let effect = scheduler
                    .timed_effect()
                    .request(req)
                    .duration(Duration::from_millis(200))
                    .on_start(|effect| effect.request().response())
                    .build()
                    .map_err(|e| HandlerError::msg(e.to_string()))?;
                effect
                    .queue()
                    .await
                    .map_err(|e| HandlerError::msg(e.to_string()))?;
                Ok(())
            }
        })
        .unwrap();
    let mut peer = SenderPeer::connect(addr).await.unwrap();
    peer.login("password").await;

    peer.send(&start_request(1, "disable_jump")).await.unwrap();
    let first = peer.expect().await;
    assert_eq!(first.id, 1);
    assert_eq!(first.result, Some(ResultType::Success));
    assert_eq!(first.time_remaining, Some(Duration::from_millis(200)));

    peer.send(&start_request(2, "disable_jump")).await.unwrap();
    let parked = peer.expect().await;
    assert_eq!(parked.id, 2);
    assert_eq!(parked.result, Some(ResultType::Queue));

    let finished = peer.expect().await;
    assert_eq!(finished.id, 1);
    assert_eq!(finished.result, Some(ResultType::Finished));

    let promoted = peer.expect().await;
    assert_eq!(promoted.id, 2);
    assert_eq!(promoted.result, Some(ResultType::Success));
    assert_eq!(promoted.time_remaining, Some(Duration::from_millis(200)));

    let finished = peer.expect().await;
    assert_eq!(finished.id, 2);
    assert_eq!(finished.result, Some(ResultType::Finished));
}

#[tokio::test]
async fn remote_function_results_reach_the_hook() {
    let (receiver, addr) = serve().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    receiver.on_remote_function_result(move |request| {
        let _ = tx.send(request.value.clone());
    });
    let mut peer = SenderPeer::connect(addr).await.unwrap();
    peer.login("password").await;

    let result = Request::builder(RequestType::RemoteFunctionResult)
        .value(serde_json::json!({"hp": 100}))
        .build()
        .unwrap();
    peer.send(&result).await.unwrap();
    let value = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("hook should fire")
        .flatten();
    assert_eq!(value, Some(serde_json::json!({"hp": 100})));
}
