//! The [`Hub`] facade: registration, routing, correlated calls and fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use relay_core::codec::{self, Dialect};
use relay_core::{ActionRequest, ActionResponse, CanonicalMessage, CorrelationToken, ObserverId};
use relay_telemetry::metrics::{
    ASK_DURATION_SECONDS, ASK_TOTAL, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL,
    CONNECTIONS_OPENED_TOTAL, DISPATCH_TOTAL, PENDING_REQUESTS,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::EventBroadcaster;
use crate::clock::Clock;
use crate::config::HubConfig;
use crate::connection::{Capability, Connection, ConnectionInfo, ConnectionKind, FrameSink};
use crate::correlation::CorrelationBridge;
use crate::errors::HubError;
use crate::events::{DisconnectLog, DisconnectReason, DisconnectRecord, HubEvent};
use crate::liveness::LivenessMonitor;
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use crate::rules::{RoutingRule, RoutingRuleStore, RoutingTable};

/// Point-in-time counters for health reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Live bot connections.
    pub bots: usize,
    /// Live worker connections.
    pub workers: usize,
    /// Live observer connections.
    pub observers: usize,
    /// Outstanding correlated calls.
    pub pending_requests: usize,
    /// Issue time of the oldest outstanding call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_pending: Option<DateTime<Utc>>,
    /// Active routing rules.
    pub rules: usize,
}

struct Inner {
    config: HubConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn RoutingRuleStore>,
    registry: Arc<ConnectionRegistry>,
    rules: RwLock<RoutingTable>,
    router: Router,
    bridge: CorrelationBridge,
    broadcaster: EventBroadcaster,
    disconnects: DisconnectLog,
    serials: AtomicU64,
    sequence: AtomicU64,
    started_at: DateTime<Utc>,
}

/// Message hub. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    /// Build a hub. Rules are not loaded until [`Hub::reload_rules`].
    pub fn new(
        config: HubConfig,
        store: Arc<dyn RoutingRuleStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster =
            EventBroadcaster::new(Arc::clone(&registry), config.evict_failed_subscribers);
        let started_at = clock.now();
        Self {
            inner: Arc::new(Inner {
                disconnects: DisconnectLog::new(config.disconnect_log_capacity),
                config,
                clock,
                store,
                registry,
                rules: RwLock::new(RoutingTable::default()),
                router: Router::new(),
                bridge: CorrelationBridge::new(),
                broadcaster,
                serials: AtomicU64::new(1),
                sequence: AtomicU64::new(1),
                started_at,
            }),
        }
    }

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Current time from the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// When the hub was built.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub(crate) fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    fn next_serial(&self) -> u64 {
        self.inner.serials.fetch_add(1, Ordering::Relaxed)
    }

    fn next_token(&self, action: &str) -> CorrelationToken {
        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        CorrelationToken::generate(action, seq)
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Register a bot under its self id.
    pub async fn register_bot(
        &self,
        id: &str,
        platform: &str,
        dialect: Dialect,
        sink: Box<dyn FrameSink>,
    ) -> Arc<Connection> {
        let conn = Connection::new(ConnectionKind::Bot, id, self.next_serial(), sink, self.now())
            .with_platform(platform)
            .with_dialect(dialect)
            .with_write_timeout(self.inner.config.write_timeout());
        self.admit(conn).await
    }

    /// Register a worker under its id.
    pub async fn register_worker(
        &self,
        id: &str,
        dialect: Dialect,
        capabilities: Vec<Capability>,
        sink: Box<dyn FrameSink>,
    ) -> Arc<Connection> {
        let conn = Connection::new(ConnectionKind::Worker, id, self.next_serial(), sink, self.now())
            .with_dialect(dialect)
            .with_capabilities(capabilities)
            .with_write_timeout(self.inner.config.write_timeout());
        self.admit(conn).await
    }

    /// Register an observer under a generated id.
    pub async fn register_observer(&self, sink: Box<dyn FrameSink>) -> Arc<Connection> {
        let id = ObserverId::new();
        let conn = Connection::new(
            ConnectionKind::Observer,
            id.as_str(),
            self.next_serial(),
            sink,
            self.now(),
        )
        .with_write_timeout(self.inner.config.write_timeout());
        self.admit(conn).await
    }

    async fn admit(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let kind = conn.kind();
        let displaced = match kind {
            ConnectionKind::Observer => self.inner.broadcaster.subscribe(Arc::clone(&conn)),
            _ => self.inner.registry.register(Arc::clone(&conn)),
        };
        counter!(CONNECTIONS_OPENED_TOTAL, "kind" => kind.as_str()).increment(1);
        self.update_active_gauge(kind);

        if let Some(old) = displaced.filter(|old| old.serial() != conn.serial()) {
            let _ = self.finish(&old, DisconnectReason::Replaced);
            self.broadcast(closed_event(&old, DisconnectReason::Replaced))
                .await;
        }

        info!(
            kind = %kind,
            conn_id = conn.id(),
            serial = conn.serial(),
            platform = conn.platform().unwrap_or(""),
            dialect = %conn.dialect(),
            "connection registered"
        );
        self.broadcast(HubEvent::ConnectionOpened {
            kind,
            id: conn.id().to_string(),
            platform: conn.platform().map(str::to_string),
        })
        .await;
        conn
    }

    /// Remove the connection registered under `id`. Returns whether one was
    /// registered.
    pub async fn unregister(&self, kind: ConnectionKind, id: &str) -> bool {
        match self.inner.registry.get(kind, id) {
            Some(conn) => self.evict(&conn, DisconnectReason::Unregistered).await.is_some(),
            None => false,
        }
    }

    /// The read loop for `conn` ended. A no-op if `conn` was already evicted
    /// or replaced.
    pub async fn connection_lost(
        &self,
        conn: &Arc<Connection>,
        reason: DisconnectReason,
    ) -> Option<DisconnectRecord> {
        self.evict(conn, reason).await
    }

    /// Remove `conn` if it is still registered, close it, fail its pending
    /// requests and tell observers.
    pub(crate) async fn evict(
        &self,
        conn: &Arc<Connection>,
        reason: DisconnectReason,
    ) -> Option<DisconnectRecord> {
        let record = self.remove(conn, reason)?;
        self.broadcast(closed_event(conn, reason)).await;
        Some(record)
    }

    /// Like [`Hub::evict`], but observers are told from a spawned task so the
    /// caller can move on to the next candidate straight away.
    fn evict_detached(&self, conn: &Arc<Connection>, reason: DisconnectReason) {
        if self.remove(conn, reason).is_none() {
            return;
        }
        let hub = self.clone();
        let event = closed_event(conn, reason);
        let _ = tokio::spawn(async move {
            let _ = hub.broadcast(event).await;
        });
    }

    fn remove(&self, conn: &Arc<Connection>, reason: DisconnectReason) -> Option<DisconnectRecord> {
        if !self.inner.registry.remove_exact(conn) {
            return None;
        }
        conn.close();
        let record = self.finish(conn, reason);
        self.update_active_gauge(conn.kind());
        Some(record)
    }

    /// Bookkeeping for a connection that has left the registry.
    fn finish(&self, conn: &Connection, reason: DisconnectReason) -> DisconnectRecord {
        let now = self.now();
        let record = DisconnectRecord {
            kind: conn.kind(),
            id: conn.id().to_string(),
            serial: conn.serial(),
            reason,
            lifetime_ms: (now - conn.connected_at()).num_milliseconds().max(0),
            at: now,
        };
        self.inner.disconnects.push(record.clone());
        let failed = self.inner.bridge.fail_owner(conn.serial(), conn.id(), reason);
        gauge!(PENDING_REQUESTS).set(self.inner.bridge.pending_count() as f64);
        counter!(
            CONNECTIONS_CLOSED_TOTAL,
            "kind" => conn.kind().as_str(),
            "reason" => reason.as_str()
        )
        .increment(1);
        info!(
            kind = %conn.kind(),
            conn_id = conn.id(),
            serial = conn.serial(),
            %reason,
            lifetime_ms = record.lifetime_ms,
            failed_requests = failed,
            "connection removed"
        );
        record
    }

    fn update_active_gauge(&self, kind: ConnectionKind) {
        gauge!(CONNECTIONS_ACTIVE, "kind" => kind.as_str())
            .set(self.inner.registry.len(kind) as f64);
    }

    /// Record a heartbeat for `conn`.
    pub fn touch(&self, conn: &Connection) {
        conn.touch(self.now());
    }

    /// Replace a worker's advertised capabilities.
    pub fn set_capabilities(
        &self,
        worker_id: &str,
        capabilities: Vec<Capability>,
    ) -> Result<(), HubError> {
        let worker = self
            .inner
            .registry
            .get(ConnectionKind::Worker, worker_id)
            .ok_or_else(|| HubError::UnknownConnection {
                kind: ConnectionKind::Worker,
                id: worker_id.to_string(),
            })?;
        debug!(conn_id = worker_id, count = capabilities.len(), "capabilities updated");
        worker.set_capabilities(capabilities);
        Ok(())
    }

    /// Look up a live connection.
    pub fn get(&self, kind: ConnectionKind, id: &str) -> Option<Arc<Connection>> {
        self.inner.registry.get(kind, id)
    }

    /// Snapshot of every live connection, bots first, then workers, then
    /// observers, each ordered by id.
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        [
            ConnectionKind::Bot,
            ConnectionKind::Worker,
            ConnectionKind::Observer,
        ]
        .into_iter()
        .flat_map(|kind| self.inner.registry.snapshot(kind))
        .map(|c| c.info())
        .collect()
    }

    /// Counters for health reporting.
    pub fn stats(&self) -> HubStats {
        let reg = &self.inner.registry;
        HubStats {
            bots: reg.len(ConnectionKind::Bot),
            workers: reg.len(ConnectionKind::Worker),
            observers: reg.len(ConnectionKind::Observer),
            pending_requests: self.inner.bridge.pending_count(),
            oldest_pending: self.inner.bridge.oldest_issued_at(),
            rules: self.inner.rules.read().len(),
        }
    }

    // ── Routing ─────────────────────────────────────────────────────────

    fn candidates(&self, routing_key: &str) -> Vec<Arc<Connection>> {
        let workers = self.inner.registry.snapshot(ConnectionKind::Worker);
        let target = self
            .inner
            .rules
            .read()
            .resolve(routing_key)
            .map(|rule| rule.target.clone());
        self.inner.router.candidates(target.as_deref(), &workers)
    }

    /// Deliver an event to one worker. Returns the id of the worker that
    /// accepted it.
    #[instrument(skip_all, fields(routing_key = %routing_key))]
    pub async fn dispatch(
        &self,
        routing_key: &str,
        message: &CanonicalMessage,
    ) -> Result<String, HubError> {
        let mut frames: HashMap<Dialect, String> = HashMap::new();
        for conn in self.candidates(routing_key) {
            let frame = frames
                .entry(conn.dialect())
                .or_insert_with(|| codec::encode_string(message, conn.dialect()))
                .clone();
            match conn.send(frame).await {
                Ok(()) => {
                    counter!(DISPATCH_TOTAL, "outcome" => "delivered").increment(1);
                    debug!(conn_id = conn.id(), "dispatched");
                    return Ok(conn.id().to_string());
                }
                Err(e) => {
                    warn!(conn_id = conn.id(), error = %e, "dispatch write failed, evicting");
                    counter!(DISPATCH_TOTAL, "outcome" => "write_error").increment(1);
                    self.evict_detached(&conn, DisconnectReason::WriteError);
                }
            }
        }
        counter!(DISPATCH_TOTAL, "outcome" => "no_target").increment(1);
        warn!("no worker available, dropping payload");
        Err(HubError::NoTargetAvailable {
            routing_key: routing_key.to_string(),
        })
    }

    /// Send `request` to a worker chosen like [`Hub::dispatch`] and wait for
    /// its reply. `deadline` defaults to the configured ask timeout.
    #[instrument(skip_all, fields(routing_key = %routing_key, action = %request.action))]
    pub async fn ask(
        &self,
        routing_key: &str,
        request: ActionRequest,
        deadline: Option<Duration>,
    ) -> Result<ActionResponse, HubError> {
        let deadline = deadline.unwrap_or_else(|| self.inner.config.ask_timeout());
        let token = self.next_token(&request.action);
        let request = request.with_echo(token.as_str());

        for conn in self.candidates(routing_key) {
            let reply = self
                .inner
                .bridge
                .register(token.clone(), conn.serial(), self.now());
            let frame = codec::encode_action(&request, conn.dialect()).to_string();
            match conn.send(frame).await {
                Ok(()) => {
                    debug!(conn_id = conn.id(), token = %token, "request sent");
                    return self.await_reply("worker", reply.wait(deadline)).await;
                }
                Err(e) => {
                    warn!(conn_id = conn.id(), error = %e, "ask write failed, evicting");
                    drop(reply);
                    self.evict_detached(&conn, DisconnectReason::WriteError);
                }
            }
        }
        counter!(ASK_TOTAL, "target" => "worker", "outcome" => "no_target").increment(1);
        Err(HubError::NoTargetAvailable {
            routing_key: routing_key.to_string(),
        })
    }

    /// Send `request` to a bot and wait for its reply. With no `bot_id` the
    /// first live bot (by id) is used.
    #[instrument(skip_all, fields(bot_id = bot_id.unwrap_or("*"), action = %request.action))]
    pub async fn call_bot(
        &self,
        bot_id: Option<&str>,
        request: ActionRequest,
        deadline: Option<Duration>,
    ) -> Result<ActionResponse, HubError> {
        let deadline = deadline.unwrap_or_else(|| self.inner.config.ask_timeout());
        let bot = match bot_id {
            Some(id) => self.inner.registry.get(ConnectionKind::Bot, id),
            None => self
                .inner
                .registry
                .snapshot(ConnectionKind::Bot)
                .into_iter()
                .next(),
        };
        let Some(bot) = bot else {
            counter!(ASK_TOTAL, "target" => "bot", "outcome" => "no_target").increment(1);
            return Err(HubError::NoTargetAvailable {
                routing_key: format!("bot:{}", bot_id.unwrap_or("*")),
            });
        };

        let token = self.next_token(&request.action);
        let request = request.with_echo(token.as_str());
        let reply = self
            .inner
            .bridge
            .register(token.clone(), bot.serial(), self.now());
        let frame = codec::encode_action(&request, bot.dialect()).to_string();
        if let Err(e) = bot.send(frame).await {
            warn!(conn_id = bot.id(), error = %e, "bot write failed, evicting");
            drop(reply);
            self.evict_detached(&bot, DisconnectReason::WriteError);
            counter!(ASK_TOTAL, "target" => "bot", "outcome" => "write_error").increment(1);
            return Err(HubError::ConnectionLost {
                id: bot.id().to_string(),
                reason: DisconnectReason::WriteError,
            });
        }
        debug!(conn_id = bot.id(), token = %token, "bot request sent");
        self.await_reply("bot", reply.wait(deadline)).await
    }

    async fn await_reply(
        &self,
        target: &'static str,
        wait: impl Future<Output = Result<ActionResponse, HubError>>,
    ) -> Result<ActionResponse, HubError> {
        gauge!(PENDING_REQUESTS).set(self.inner.bridge.pending_count() as f64);
        let started = Instant::now();
        let result = wait.await;
        histogram!(ASK_DURATION_SECONDS, "target" => target).record(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.error_kind(),
        };
        counter!(ASK_TOTAL, "target" => target, "outcome" => outcome).increment(1);
        gauge!(PENDING_REQUESTS).set(self.inner.bridge.pending_count() as f64);
        result
    }

    /// Route a reply to its waiter by echo token. Returns `false` for
    /// missing, unknown or expired tokens.
    pub fn handle_reply(&self, response: ActionResponse) -> bool {
        let Some(token) = response.echo.clone() else {
            return false;
        };
        self.inner.bridge.resolve(&token, response)
    }

    /// Number of outstanding correlated calls.
    pub fn pending_count(&self) -> usize {
        self.inner.bridge.pending_count()
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    /// Send `event` to every observer. Returns the number delivered.
    pub async fn broadcast(&self, event: HubEvent) -> usize {
        let outcome = self.inner.broadcaster.broadcast(&event).await;
        for sub in &outcome.evicted {
            let _ = self.finish(sub, DisconnectReason::WriteError);
        }
        if !outcome.evicted.is_empty() {
            self.update_active_gauge(ConnectionKind::Observer);
        }
        outcome.delivered
    }

    // ── Rules ───────────────────────────────────────────────────────────

    /// Reload the routing table from the store. Returns the rule count.
    pub async fn reload_rules(&self) -> Result<usize, HubError> {
        let rules = self.inner.store.load().await?;
        let table = RoutingTable::new(rules);
        let count = table.len();
        *self.inner.rules.write() = table;
        info!(count, "routing rules loaded");
        self.broadcast(HubEvent::RulesChanged { count }).await;
        Ok(count)
    }

    /// Insert or replace a rule in the store and reload.
    pub async fn upsert_rule(&self, rule: RoutingRule) -> Result<(), HubError> {
        self.inner.store.upsert(rule).await?;
        let _ = self.reload_rules().await?;
        Ok(())
    }

    /// Delete a rule from the store and reload. Returns whether it existed.
    pub async fn delete_rule(&self, pattern: &str) -> Result<bool, HubError> {
        let existed = self.inner.store.delete(pattern).await?;
        let _ = self.reload_rules().await?;
        Ok(existed)
    }

    /// Active rules in precedence order.
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.inner.rules.read().rules().to_vec()
    }

    // ── Liveness ────────────────────────────────────────────────────────

    /// Up to `limit` most recent disconnect records, oldest first.
    pub fn disconnects(&self, limit: usize) -> Vec<DisconnectRecord> {
        self.inner.disconnects.recent(limit)
    }

    /// Liveness monitor bound to this hub.
    pub fn liveness(&self) -> LivenessMonitor {
        LivenessMonitor::new(self.clone())
    }

    /// Run the liveness sweep on its own task until `cancel` fires.
    pub fn spawn_liveness(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.liveness();
        tokio::spawn(async move { monitor.run(cancel).await })
    }
}

fn closed_event(conn: &Connection, reason: DisconnectReason) -> HubEvent {
    HubEvent::ConnectionClosed {
        kind: conn.kind(),
        id: conn.id().to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connection::tests::RecordingSink;
    use crate::rules::MemoryRuleStore;
    use assert_matches::assert_matches;
    use relay_core::{Envelope, EventBody, MetaEvent};
    use serde_json::{Value, json};

    fn hub() -> Hub {
        hub_with_config(HubConfig::default())
    }

    fn hub_with_config(config: HubConfig) -> Hub {
        Hub::new(
            config,
            Arc::new(MemoryRuleStore::new()),
            Arc::new(ManualClock::default()),
        )
    }

    fn heartbeat() -> CanonicalMessage {
        CanonicalMessage::new(
            Envelope::default(),
            EventBody::Meta(MetaEvent {
                meta_type: "heartbeat".into(),
                sub_type: None,
                interval: None,
                status: None,
            }),
        )
    }

    #[tokio::test]
    async fn dispatch_encodes_in_worker_dialect() {
        let hub = hub();
        let sink = RecordingSink::default();
        let _ = hub
            .register_worker("w1", Dialect::Structured, vec![], Box::new(sink.clone()))
            .await;
        let target = hub.dispatch("bot:1", &heartbeat()).await.unwrap();
        assert_eq!(target, "w1");
        let frame: Value = serde_json::from_str(&sink.frames.lock()[0]).unwrap();
        assert_eq!(frame["type"], "meta");
    }

    #[tokio::test]
    async fn dispatch_without_workers_fails() {
        let hub = hub();
        assert_matches!(
            hub.dispatch("grp:1", &heartbeat()).await,
            Err(HubError::NoTargetAvailable { routing_key }) if routing_key == "grp:1"
        );
    }

    #[tokio::test]
    async fn ask_round_trip() {
        let hub = hub();
        let sink = RecordingSink::default();
        let _ = hub
            .register_worker("w1", Dialect::FlatText, vec![], Box::new(sink.clone()))
            .await;

        let h = hub.clone();
        let call = tokio::spawn(async move {
            h.ask("usr:1", ActionRequest::new("weather", json!({})), None)
                .await
        });
        let echo = loop {
            if let Some(frame) = sink.frames.lock().first().cloned() {
                let v: Value = serde_json::from_str(&frame).unwrap();
                break v["echo"].as_str().unwrap().to_string();
            }
            tokio::task::yield_now().await;
        };
        assert!(echo.starts_with("weather:"));
        assert!(hub.handle_reply(ActionResponse::ok(json!("sunny")).with_echo(Some(echo))));
        let resp = call.await.unwrap().unwrap();
        assert_eq!(resp.data, json!("sunny"));
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_without_echo_is_ignored() {
        assert!(!hub().handle_reply(ActionResponse::ok(json!(null))));
    }

    #[tokio::test]
    async fn call_bot_without_bots_fails() {
        let hub = hub();
        assert_matches!(
            hub.call_bot(None, ActionRequest::new("send_msg", json!({})), None).await,
            Err(HubError::NoTargetAvailable { routing_key }) if routing_key == "bot:*"
        );
    }

    #[tokio::test]
    async fn call_bot_write_failure_evicts() {
        let hub = hub();
        let sink = RecordingSink::default();
        sink.fail.store(true, Ordering::SeqCst);
        let _ = hub
            .register_bot("b1", "qq", Dialect::FlatText, Box::new(sink))
            .await;
        let err = hub
            .call_bot(Some("b1"), ActionRequest::new("send_msg", json!({})), None)
            .await
            .unwrap_err();
        assert_matches!(err, HubError::ConnectionLost { reason: DisconnectReason::WriteError, .. });
        assert!(hub.get(ConnectionKind::Bot, "b1").is_none());
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_worker_is_skipped_and_evicted() {
        let hub = hub_with_config(HubConfig {
            write_timeout_ms: 250,
            ..HubConfig::default()
        });
        let stalled = RecordingSink::default();
        let healthy = RecordingSink::default();
        let w1 = hub
            .register_worker("w1", Dialect::FlatText, vec![], Box::new(stalled.clone()))
            .await;
        let _ = hub
            .register_worker("w2", Dialect::FlatText, vec![], Box::new(healthy.clone()))
            .await;
        hub.upsert_rule(RoutingRule::new("grp:1", "w1")).await.unwrap();
        stalled.stall.store(true, Ordering::SeqCst);

        assert_eq!(hub.dispatch("grp:1", &heartbeat()).await.unwrap(), "w2");
        assert_eq!(healthy.frames.lock().len(), 1);
        assert!(w1.is_closed());
        assert!(hub.get(ConnectionKind::Worker, "w1").is_none());
        let record = hub.disconnects(1).pop().unwrap();
        assert_eq!(record.id, "w1");
        assert_eq!(record.reason, DisconnectReason::WriteError);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_does_not_wait_for_observers() {
        let hub = hub_with_config(HubConfig {
            write_timeout_ms: 3_600_000,
            evict_failed_subscribers: false,
            ..HubConfig::default()
        });
        let observer = RecordingSink::default();
        let _ = hub.register_observer(Box::new(observer.clone())).await;
        let broken = RecordingSink::default();
        broken.fail.store(true, Ordering::SeqCst);
        let _ = hub
            .register_worker("w1", Dialect::FlatText, vec![], Box::new(broken))
            .await;
        let _ = hub
            .register_worker("w2", Dialect::FlatText, vec![], Box::new(RecordingSink::default()))
            .await;
        hub.upsert_rule(RoutingRule::new("grp:1", "w1")).await.unwrap();
        observer.stall.store(true, Ordering::SeqCst);

        // The closed event for w1 hangs on the observer for an hour; the
        // fallback to w2 must not.
        let target = tokio::time::timeout(
            Duration::from_secs(1),
            hub.dispatch("grp:1", &heartbeat()),
        )
        .await
        .expect("dispatch finished before the observer write")
        .unwrap();
        assert_eq!(target, "w2");
        assert!(hub.get(ConnectionKind::Worker, "w1").is_none());
    }

    #[tokio::test]
    async fn evicted_worker_is_announced_to_observers() {
        let hub = hub();
        let observer = RecordingSink::default();
        let _ = hub.register_observer(Box::new(observer.clone())).await;
        let broken = RecordingSink::default();
        broken.fail.store(true, Ordering::SeqCst);
        let _ = hub
            .register_worker("w1", Dialect::FlatText, vec![], Box::new(broken))
            .await;
        assert_matches!(
            hub.dispatch("grp:1", &heartbeat()).await,
            Err(HubError::NoTargetAvailable { .. })
        );

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let found = observer
                    .frames
                    .lock()
                    .iter()
                    .any(|f| f.contains("connection_closed") && f.contains("\"w1\""));
                if found {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn set_capabilities_requires_worker() {
        let hub = hub();
        assert_matches!(
            hub.set_capabilities("w9", vec![]),
            Err(HubError::UnknownConnection { kind: ConnectionKind::Worker, .. })
        );
        let _ = hub
            .register_worker("w9", Dialect::FlatText, vec![], Box::new(RecordingSink::default()))
            .await;
        let cap = Capability {
            name: "echo".into(),
            description: "repeat input".into(),
            parameters: json!({}),
        };
        hub.set_capabilities("w9", vec![cap]).unwrap();
        assert_eq!(hub.list_connections()[0].capabilities.len(), 1);
    }

    #[tokio::test]
    async fn unregister_records_reason() {
        let hub = hub();
        let _ = hub
            .register_bot("b1", "qq", Dialect::FlatText, Box::new(RecordingSink::default()))
            .await;
        assert!(hub.unregister(ConnectionKind::Bot, "b1").await);
        assert!(!hub.unregister(ConnectionKind::Bot, "b1").await);
        let records = hub.disconnects(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, DisconnectReason::Unregistered);
    }

    #[tokio::test]
    async fn connection_lost_ignores_replaced_connection() {
        let hub = hub();
        let old = hub
            .register_bot("b1", "qq", Dialect::FlatText, Box::new(RecordingSink::default()))
            .await;
        let new = hub
            .register_bot("b1", "qq", Dialect::FlatText, Box::new(RecordingSink::default()))
            .await;
        assert!(old.is_closed());
        assert!(hub.connection_lost(&old, DisconnectReason::Closed).await.is_none());
        assert_eq!(hub.get(ConnectionKind::Bot, "b1").unwrap().serial(), new.serial());
        let reasons: Vec<_> = hub.disconnects(10).into_iter().map(|r| r.reason).collect();
        assert_eq!(reasons, [DisconnectReason::Replaced]);
    }

    #[tokio::test]
    async fn observers_hear_connection_events() {
        let hub = hub();
        let sink = RecordingSink::default();
        let obs = hub.register_observer(Box::new(sink.clone())).await;
        assert!(obs.id().starts_with("obs_"));
        let _ = hub
            .register_worker("w1", Dialect::FlatText, vec![], Box::new(RecordingSink::default()))
            .await;
        let frames = sink.frames.lock().clone();
        let last: Value = serde_json::from_str(frames.last().unwrap()).unwrap();
        assert_eq!(last["event"], "connection_opened");
        assert_eq!(last["id"], "w1");
    }

    #[tokio::test]
    async fn rule_crud_reloads_table() {
        let hub = hub();
        hub.upsert_rule(RoutingRule::new("grp:*", "w1")).await.unwrap();
        assert_eq!(hub.rules().len(), 1);
        assert_eq!(hub.stats().rules, 1);
        assert!(hub.delete_rule("grp:*").await.unwrap());
        assert!(hub.rules().is_empty());
    }
}
