//! Channels over real TCP connections.

use conduit_core::liveness::DisposeReason;
use conduit_core::messaging::encode_call;
use conduit_core::{
    InvalidMessagePolicy, LivenessConfig, MessageChannel, PingResponder, Pinger, PingerState,
    RequestReceiver, Requester, StreamChannel,
};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

async fn connected_pair() -> (Arc<StreamChannel>, Arc<StreamChannel>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client = StreamChannel::from_tcp(
        "client",
        client.unwrap(),
        InvalidMessagePolicy::DisposeChannel,
    );
    let server = StreamChannel::from_tcp(
        "server",
        accepted.unwrap().0,
        InvalidMessagePolicy::DisposeChannel,
    );
    (client, server)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_request_round_trip_over_tcp() {
    let (client, server) = connected_pair().await;

    let _receiver = RequestReceiver::new(
        "conduit",
        server.clone(),
        Arc::new(|payload: Value| {
            async move {
                let function = payload["function_name"].as_str().unwrap_or_default().to_string();
                Ok(json!({ "called": function }))
            }
            .boxed()
        }),
    );
    let requester = Requester::new("conduit", client.clone());

    let reply = requester
        .post_request(encode_call("list_readers", vec![json!(null)]))
        .await
        .unwrap();
    assert_eq!(reply, json!({"called": "list_readers"}));
}

#[tokio::test]
async fn test_liveness_over_tcp() {
    let (client, server) = connected_pair().await;
    let responder = PingResponder::new(server.clone());

    let (established_tx, established_rx) = oneshot::channel();
    let config = LivenessConfig::new(Duration::from_millis(50), Duration::from_secs(5)).unwrap();
    let pinger = Pinger::new(
        client.clone(),
        config,
        Some(Box::new(move || {
            let _ = established_tx.send(());
        })),
    );

    established_rx.await.unwrap();
    assert_eq!(pinger.state(), PingerState::Established);
    assert_eq!(pinger.remote_channel_id(), Some(responder.channel_id()));

    // Closing the far end is seen as an end of stream.
    server.dispose();
    wait_until(|| client.is_disposed()).await;
    wait_until(|| pinger.is_disposed()).await;
    assert_eq!(
        pinger.state(),
        PingerState::Disposed(DisposeReason::ChannelClosed)
    );
}

#[tokio::test]
async fn test_pending_requests_fail_when_peer_goes_away() {
    let (client, server) = connected_pair().await;
    let requester = Requester::new("conduit", client.clone());

    // Nobody serves requests on the server side.
    let reply = requester.post_request(encode_call("never", vec![]));
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.dispose();

    assert!(reply.await.unwrap_err().is_disposal());
    assert!(client.is_disposed());
}
