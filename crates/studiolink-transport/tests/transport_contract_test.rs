//! The same call contract, exercised over every transport through
//! `dyn Transport`.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use studiolink_transport::{
    port_pair, wait_for_state, LocalBrokerTransport, MemoryNetwork, PeerToPeerTransport,
    SignalMessage, Transport,
};
use studiolink_types::{ConnectionState, PeerId};
use studiolink_wire::{CallOptions, EngineConfig, HandlerReply, Request, RpcError};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn local_pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
    let (a, b) = port_pair();
    (
        LocalBrokerTransport::new(PeerId::from("b"), a, EngineConfig::default()),
        LocalBrokerTransport::new(PeerId::from("a"), b, EngineConfig::default()),
    )
}

fn relay_into(
    target: mpsc::UnboundedSender<SignalMessage>,
) -> Arc<dyn Fn(SignalMessage) + Send + Sync> {
    Arc::new(move |signal| {
        let _ = target.send(signal);
    })
}

fn p2p_pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
    let network = MemoryNetwork::new();
    let (to_b, mut b_inbox) = mpsc::unbounded_channel();
    let (to_a, mut a_inbox) = mpsc::unbounded_channel();

    let a = PeerToPeerTransport::new(
        PeerId::from("b"),
        true,
        network.session(),
        relay_into(to_b),
        EngineConfig::default(),
    )
    .unwrap();
    let b = PeerToPeerTransport::new(
        PeerId::from("a"),
        false,
        network.session(),
        relay_into(to_a),
        EngineConfig::default(),
    )
    .unwrap();

    let b_signals = b.clone();
    tokio::spawn(async move {
        while let Some(signal) = b_inbox.recv().await {
            b_signals.handle_signal(signal);
        }
    });
    let a_signals = a.clone();
    tokio::spawn(async move {
        while let Some(signal) = a_inbox.recv().await {
            a_signals.handle_signal(signal);
        }
    });
    (a, b)
}

async fn exercise(a: Arc<dyn Transport>, b: Arc<dyn Transport>) {
    for t in [&a, &b] {
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_state(t.as_ref(), ConnectionState::Connected),
        )
        .await
        .expect("transport did not connect");
    }

    b.engine().register("project.files", |req: Request| async move {
        let dir = req.args[0]["dir"].as_str().unwrap_or("/").to_string();
        Ok(HandlerReply::value(json!([format!("{dir}/a.glb"), format!("{dir}/b.png")])))
    });
    a.engine().register("ping", |_req: Request| async move {
        Ok(HandlerReply::value("pong"))
    });

    let files = assert_ok!(
        a.engine()
            .call("project.files", vec![json!({"dir": "assets"})])
            .await
    );
    assert_eq!(files, json!(["assets/a.glb", "assets/b.png"]));

    // Calls flow in the other direction over the same transport.
    assert_eq!(assert_ok!(b.engine().call("ping", vec![]).await), json!("pong"));

    // A short timeout against a handler that never answers.
    b.engine().register("stall", |_req: Request| async move {
        std::future::pending::<()>().await;
        Ok(HandlerReply::value(()))
    });
    let err = assert_err!(
        a.engine()
            .call_with(
                "stall",
                vec![],
                CallOptions::with_timeout(Duration::from_millis(50)),
            )
            .await
    );
    assert!(err.is_timeout());

    a.close();
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(
        a.engine().call("ping", vec![]).await,
        Err(RpcError::Transport(_))
    ));
    tokio::time::timeout(
        Duration::from_secs(5),
        wait_for_state(b.as_ref(), ConnectionState::Disconnected),
    )
    .await
    .expect("remote side did not notice the close");
}

#[tokio::test]
async fn test_local_broker_transport_contract() {
    let (a, b) = local_pair();
    exercise(a, b).await;
}

#[tokio::test]
async fn test_peer_to_peer_transport_contract() {
    let (a, b) = p2p_pair();
    exercise(a, b).await;
}
