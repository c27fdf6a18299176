//! End-to-end hub scenarios over in-memory frame sinks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use relay_core::{ActionRequest, ActionResponse, CanonicalMessage, Dialect, Envelope, EventBody};
use relay_core::{MessageEvent, MessageType, Segment, Sender};
use relay_hub::{
    Clock, ConnectionKind, DisconnectReason, FrameSink, Hub, HubConfig, HubError, ManualClock,
    MemoryRuleStore, RoutingRule, TransportError,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Sink that forwards frames to a channel and can be switched to fail.
#[derive(Clone)]
struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::Write("connection reset".into()));
        }
        self.tx
            .send(text)
            .map_err(|_| TransportError::Write("receiver gone".into()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct Peer {
    rx: mpsc::UnboundedReceiver<String>,
    broken: Arc<AtomicBool>,
}

fn sink() -> (Box<dyn FrameSink>, Peer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let broken = Arc::new(AtomicBool::new(false));
    let sink = ChannelSink {
        tx,
        broken: Arc::clone(&broken),
    };
    (Box::new(sink), Peer { rx, broken })
}

impl Peer {
    fn break_socket(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    async fn next(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("frame within deadline")
            .expect("sink open");
        serde_json::from_str(&frame).unwrap()
    }
}

fn hub_with(clock: Arc<ManualClock>, rules: Vec<RoutingRule>) -> Hub {
    Hub::new(
        HubConfig::default(),
        Arc::new(MemoryRuleStore::with_rules(rules)),
        clock as Arc<dyn Clock>,
    )
}

fn hub() -> Hub {
    hub_with(Arc::new(ManualClock::default()), Vec::new())
}

fn group_message(group: &str) -> CanonicalMessage {
    CanonicalMessage::new(
        Envelope {
            self_id: "10001".into(),
            platform: "qq".into(),
            time: 1_700_000_000,
            echo: None,
        },
        EventBody::Message(MessageEvent {
            message_id: "1".into(),
            message_type: MessageType::Group,
            sub_type: None,
            user_id: "42".into(),
            group_id: Some(group.into()),
            sender: Sender {
                user_id: "42".into(),
                ..Sender::default()
            },
            segments: vec![Segment::text("ping")],
        }),
    )
}

#[tokio::test]
async fn rule_target_then_fallback_after_write_failure() {
    let hub = hub_with(
        Arc::new(ManualClock::default()),
        vec![RoutingRule::new("grp:123", "w1")],
    );
    assert_eq!(hub.reload_rules().await.unwrap(), 1);

    let (s1, mut w1) = sink();
    let (s2, mut w2) = sink();
    let _ = hub.register_worker("w1", Dialect::FlatText, vec![], s1).await;
    let _ = hub.register_worker("w2", Dialect::FlatText, vec![], s2).await;

    let msg = group_message("123");
    let key = msg.routing_key();
    assert_eq!(key, "grp:123");

    // The rule wins over the round-robin cursor every time.
    for _ in 0..3 {
        assert_eq!(hub.dispatch(&key, &msg).await.unwrap(), "w1");
    }
    assert_eq!(w1.drain().len(), 3);
    assert!(w2.drain().is_empty());

    w1.break_socket();
    assert_eq!(hub.dispatch(&key, &msg).await.unwrap(), "w2");
    let frames = w2.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["group_id"], 123);
    assert_eq!(frames[0]["message"], "ping");

    let ids: Vec<String> = hub.list_connections().into_iter().map(|c| c.id).collect();
    assert_eq!(ids, ["w2"]);
    let last = hub.disconnects(1);
    assert_eq!(last[0].id, "w1");
    assert_eq!(last[0].reason, DisconnectReason::WriteError);
}

#[tokio::test]
async fn fallback_spreads_load_across_workers() {
    let hub = hub();
    let mut peers = Vec::new();
    for id in ["w1", "w2", "w3"] {
        let (s, peer) = sink();
        let _ = hub.register_worker(id, Dialect::Structured, vec![], s).await;
        peers.push((id, peer));
    }

    let msg = group_message("7");
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..3_000 {
        let target = hub.dispatch("grp:7", &msg).await.unwrap();
        *counts.entry(target).or_default() += 1;
    }

    assert_eq!(counts.len(), 3);
    for (id, n) in &counts {
        assert!(*n > 0 && *n < 2_000, "{id} got {n}");
    }
    for (id, peer) in &mut peers {
        assert_eq!(peer.drain().len(), counts[*id]);
    }
}

#[tokio::test]
async fn no_workers_means_no_target() {
    let hub = hub();
    let (s, w) = sink();
    let _ = hub.register_worker("w1", Dialect::FlatText, vec![], s).await;
    w.break_socket();

    let err = hub.dispatch("grp:1", &group_message("1")).await.unwrap_err();
    assert_matches!(err, HubError::NoTargetAvailable { .. });
    assert!(hub.list_connections().is_empty());
}

#[tokio::test]
async fn reregistration_replaces_and_stops_old_read_loop() {
    let hub = hub();
    let (s_old, _old_peer) = sink();
    let old = hub.register_bot("b1", "qq", Dialect::FlatText, s_old).await;

    // Stand-in for the per-connection read loop.
    let watcher = {
        let old = Arc::clone(&old);
        tokio::spawn(async move { old.closed().await })
    };

    let (s_new, _new_peer) = sink();
    let new = hub.register_bot("b1", "qq", Dialect::FlatText, s_new).await;

    tokio::time::timeout(Duration::from_secs(1), watcher)
        .await
        .expect("old read loop terminates")
        .unwrap();
    assert!(old.is_closed());
    assert!(!new.is_closed());

    let bots: Vec<u64> = hub
        .list_connections()
        .into_iter()
        .filter(|c| c.kind == ConnectionKind::Bot)
        .map(|c| c.serial)
        .collect();
    assert_eq!(bots, [new.serial()]);
    assert_eq!(hub.disconnects(10)[0].reason, DisconnectReason::Replaced);
}

#[tokio::test]
async fn silent_connection_evicted_exactly_once() {
    let clock = Arc::new(ManualClock::default());
    let hub = hub_with(Arc::clone(&clock), Vec::new());
    let (s, _peer) = sink();
    let _ = hub.register_worker("w1", Dialect::FlatText, vec![], s).await;

    let window = hub.config().heartbeat_timeout();
    clock.advance(window);
    assert!(hub.liveness().sweep().await.is_empty());

    clock.advance(Duration::from_secs(1));
    assert_eq!(hub.liveness().sweep().await.len(), 1);
    assert!(hub.liveness().sweep().await.is_empty());

    let timeouts: Vec<_> = hub
        .disconnects(100)
        .into_iter()
        .filter(|r| r.reason == DisconnectReason::HeartbeatTimeout)
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].id, "w1");
    assert!(hub.list_connections().is_empty());
}

#[tokio::test]
async fn concurrent_asks_receive_their_own_replies() {
    let hub = hub();
    let (s, mut worker) = sink();
    let _ = hub.register_worker("w1", Dialect::FlatText, vec![], s).await;

    let mut calls = Vec::new();
    for i in 0..10 {
        let h = hub.clone();
        calls.push(tokio::spawn(async move {
            let req = ActionRequest::new("lookup", json!({ "n": i }));
            (i, h.ask("usr:1", req, Some(Duration::from_secs(10))).await)
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..10 {
        requests.push(worker.next().await);
    }
    assert_eq!(hub.pending_count(), 10);

    // Reply out of order.
    requests.reverse();
    for req in requests {
        let echo = req["echo"].as_str().unwrap().to_string();
        let n = req["params"]["n"].clone();
        let reply = ActionResponse::ok(json!({ "n": n })).with_echo(Some(echo));
        assert!(hub.handle_reply(reply));
    }

    for call in calls {
        let (i, result) = call.await.unwrap();
        assert_eq!(result.unwrap().data["n"], i);
    }
    assert_eq!(hub.pending_count(), 0);
}

#[tokio::test]
async fn connection_loss_fails_ask_before_deadline() {
    let hub = hub();
    let (s, mut worker) = sink();
    let conn = hub.register_worker("w1", Dialect::FlatText, vec![], s).await;

    let h = hub.clone();
    let call = tokio::spawn(async move {
        h.ask(
            "usr:1",
            ActionRequest::new("slow", json!({})),
            Some(Duration::from_secs(3_600)),
        )
        .await
    });
    let _request = worker.next().await;

    let record = hub
        .connection_lost(&conn, DisconnectReason::ReadError)
        .await
        .unwrap();
    assert_eq!(record.reason, DisconnectReason::ReadError);

    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("ask fails promptly")
        .unwrap();
    assert_matches!(
        result,
        Err(HubError::ConnectionLost { id, reason: DisconnectReason::ReadError }) if id == "w1"
    );
    assert_eq!(hub.pending_count(), 0);
}

#[tokio::test]
async fn failed_observer_is_evicted_on_first_write() {
    let hub = hub();
    let (good_sink, mut good) = sink();
    let (bad_sink, bad) = sink();
    let _ = hub.register_observer(good_sink).await;
    let bad_conn = hub.register_observer(bad_sink).await;
    let _ = good.drain();
    bad.break_socket();

    let delivered = hub
        .broadcast(relay_hub::HubEvent::Custom {
            name: "tick".into(),
            data: json!({}),
        })
        .await;
    assert_eq!(delivered, 1);
    assert!(bad_conn.is_closed());
    assert_eq!(hub.stats().observers, 1);
    assert_eq!(good.drain()[0]["name"], "tick");

    let record = hub.disconnects(1).pop().unwrap();
    assert_eq!(record.kind, ConnectionKind::Observer);
    assert_eq!(record.reason, DisconnectReason::WriteError);
}

#[tokio::test]
async fn worker_action_forwarded_to_bot() {
    let hub = hub();
    let (s, mut bot) = sink();
    let _ = hub.register_bot("b1", "qq", Dialect::Structured, s).await;

    let h = hub.clone();
    let call = tokio::spawn(async move {
        let req = ActionRequest::new(
            "send_msg",
            json!({"group_id": "5", "message": "[CQ:at,qq=9] hi"}),
        );
        h.call_bot(Some("b1"), req, Some(Duration::from_secs(5))).await
    });

    let frame = bot.next().await;
    assert_eq!(frame["action"], "send_msg");
    assert_eq!(frame["params"]["message"][0]["type"], "mention");
    let echo = frame["echo"].as_str().unwrap().to_string();
    assert!(hub.handle_reply(ActionResponse::ok(json!({"message_id": "m1"})).with_echo(Some(echo))));

    let resp = call.await.unwrap().unwrap();
    assert!(resp.is_ok());
    assert_eq!(resp.data["message_id"], "m1");
}
