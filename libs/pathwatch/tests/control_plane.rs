// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Controller and agent talking over a real WebSocket on localhost.
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, Stream, StreamExt};
use pathwatch::agent::handlers::ScheduledHandler;
use pathwatch::agent::{
    Agent, HandlerRegistry, MeasureRequest, Measurement, ShutdownTrigger, shutdown_channel,
};
use pathwatch::control::{AGENT_WS_PATH, ControlMessage};
use pathwatch::controller::{AgentRecord, ControllerState, MemorySink, MemoryStore, serve};
use pathwatch::core::{
    AgentConfig, AgentId, Probe, ProbeId, ProbeResult, ProbeTarget, ProbeType, Result,
};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

struct Controller {
    addr: SocketAddr,
    sink: Arc<MemorySink>,
    trigger: ShutdownTrigger,
}

impl Controller {
    fn url(&self) -> String {
        format!("ws://{}{}", self.addr, AGENT_WS_PATH)
    }
}

async fn start_controller() -> Controller {
    let store = MemoryStore::new();
    store.upsert_agent(AgentRecord {
        id: AgentId(1),
        name: "east".into(),
        token: "secret".into(),
        public_ip_override: None,
    });
    store.upsert_probe(
        Probe::new(ProbeId(10), AgentId(1), ProbeType::Ping)
            .with_targets(vec![ProbeTarget::literal("192.0.2.10")]),
    );

    let sink = Arc::new(MemorySink::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (trigger, mut signal) = shutdown_channel();
    let state = ControllerState::new(Arc::new(store), sink.clone());
    tokio::spawn(serve(listener, state, async move { signal.wait().await }));

    Controller {
        addr,
        sink,
        trigger,
    }
}

async fn next_control<S>(read: &mut S) -> ControlMessage
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), read.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return ControlMessage::from_json(&text).unwrap();
        }
    }
}

fn text(msg: &ControlMessage) -> Message {
    Message::Text(msg.to_json().unwrap().into())
}

#[tokio::test]
async fn test_auth_probe_get_and_post_round_trip() {
    let controller = start_controller().await;
    let (ws, _) = connect_async(controller.url()).await.unwrap();
    let (mut write, mut read) = ws.split();

    write
        .send(text(&ControlMessage::Auth {
            agent_id: AgentId(1),
            token: "secret".into(),
        }))
        .await
        .unwrap();
    assert_eq!(
        next_control(&mut read).await,
        ControlMessage::AuthOk {
            agent_id: AgentId(1)
        }
    );

    write
        .send(text(&ControlMessage::ProbeGet {
            agent_id: AgentId(1),
        }))
        .await
        .unwrap();
    match next_control(&mut read).await {
        ControlMessage::ProbeGetOk { probes } => {
            assert_eq!(probes.len(), 1);
            assert_eq!(probes[0].id, ProbeId(10));
            assert_eq!(probes[0].targets[0].target, "192.0.2.10");
        }
        other => panic!("unexpected frame {:?}", other),
    }

    let result = ProbeResult::new(
        ProbeId(10),
        ProbeType::Ping,
        "192.0.2.10",
        AgentId::NONE,
        serde_json::json!({ "loss_percentage": 0.0 }),
    );
    write
        .send(text(&ControlMessage::ProbePost(result)))
        .await
        .unwrap();
    match next_control(&mut read).await {
        ControlMessage::ProbePostOk { probe_id, .. } => assert_eq!(probe_id, ProbeId(10)),
        other => panic!("unexpected frame {:?}", other),
    }

    let records = controller.sink.records_from_agent(AgentId(1));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].result.probe_type, ProbeType::Ping);
    controller.trigger.trigger();
}

#[tokio::test]
async fn test_bad_token_is_rejected() {
    let controller = start_controller().await;
    let (ws, _) = connect_async(controller.url()).await.unwrap();
    let (mut write, mut read) = ws.split();

    write
        .send(text(&ControlMessage::Auth {
            agent_id: AgentId(1),
            token: "wrong".into(),
        }))
        .await
        .unwrap();
    assert!(matches!(
        next_control(&mut read).await,
        ControlMessage::Error { .. }
    ));

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match read.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(controller.sink.is_empty());
    controller.trigger.trigger();
}

struct CountingMeasurement(Arc<AtomicUsize>);

impl Measurement for CountingMeasurement {
    fn measure(&self, request: MeasureRequest) -> BoxFuture<'static, Result<serde_json::Value>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(serde_json::json!({ "host": request.host })) })
    }
}

#[tokio::test]
async fn test_agent_pulls_probes_and_posts_results() {
    let controller = start_controller().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = HandlerRegistry::new();
    registry.register(
        ProbeType::Ping,
        Arc::new(ScheduledHandler::new(
            ProbeType::Ping,
            Arc::new(CountingMeasurement(calls.clone())),
            5,
        )),
    );

    let config = AgentConfig {
        agent_id: AgentId(1),
        token: "secret".into(),
        controller_url: controller.url(),
        graceful_shutdown_ms: 500,
        ..AgentConfig::default()
    };
    let (trigger, signal) = shutdown_channel();
    let agent = tokio::spawn(Agent::with_registry(config, Arc::new(registry)).run(signal));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while controller.sink.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let records = controller.sink.records_for_probe(ProbeId(10));
    assert!(!records.is_empty());
    assert_eq!(records[0].agent_id, AgentId(1));
    assert_eq!(records[0].result.payload["host"], "192.0.2.10");
    assert!(calls.load(Ordering::SeqCst) >= 1);

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(5), agent)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    controller.trigger.trigger();
}
