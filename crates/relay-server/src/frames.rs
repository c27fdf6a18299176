//! Inbound text frame handling per connection role.
//!
//! Bots send events (dispatched to a worker) and replies to hub-issued
//! actions. Workers send replies, heartbeats, capability registrations and
//! actions that are forwarded to a bot. Observers only listen.

use std::sync::Arc;

use metrics::counter;
use relay_core::action::retcode;
use relay_core::codec::{self, CodecError};
use relay_core::{ActionRequest, ActionResponse};
use relay_hub::{Capability, Connection, Hub, HubError};
use relay_telemetry::metrics::DECODE_ERRORS_TOTAL;
use serde_json::{Value, json};
use tracing::{Instrument, debug, info_span, warn};

/// Worker action that only refreshes liveness.
pub const HEARTBEAT_ACTION: &str = "heartbeat";
/// Worker action that replaces the advertised capability list.
pub const REGISTER_CAPABILITIES_ACTION: &str = "register_capabilities";

/// What a frame turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Liveness-only frame.
    Heartbeat,
    /// Reply to a correlated call; `matched` is false for unknown or expired
    /// tokens.
    Reply {
        /// Whether a waiter received it.
        matched: bool,
    },
    /// Event delivered to the named worker.
    Dispatched(String),
    /// Event dropped because no worker accepted it.
    Dropped,
    /// Worker capability list replaced.
    Capabilities(usize),
    /// Worker action handed to a background forward.
    Forwarding,
    /// Valid frame with nothing to do.
    Ignored,
    /// Frame could not be decoded.
    Invalid,
}

/// Handle a text frame from a bot.
pub async fn handle_bot_frame(hub: &Hub, bot: &Arc<Connection>, text: &str) -> FrameOutcome {
    let mut msg = match codec::decode_str(text) {
        Ok((msg, _)) => msg,
        Err(e) => return decode_failed(bot, &e),
    };
    if let Some(reply) = ActionResponse::from_message(&msg) {
        return FrameOutcome::Reply {
            matched: hub.handle_reply(reply),
        };
    }
    if msg.is_heartbeat() {
        return FrameOutcome::Heartbeat;
    }

    if msg.envelope.self_id.is_empty() {
        msg.envelope.self_id = bot.id().to_string();
    }
    if msg.envelope.platform.is_empty() {
        if let Some(platform) = bot.platform() {
            msg.envelope.platform = platform.to_string();
        }
    }

    let routing_key = msg.routing_key();
    match hub.dispatch(&routing_key, &msg).await {
        Ok(worker) => FrameOutcome::Dispatched(worker),
        Err(e) => {
            debug!(conn_id = bot.id(), routing_key, error = %e, "event dropped");
            FrameOutcome::Dropped
        }
    }
}

/// Handle a text frame from a worker.
pub async fn handle_worker_frame(hub: &Hub, worker: &Arc<Connection>, text: &str) -> FrameOutcome {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return decode_failed(worker, &CodecError::from(e)),
    };

    if codec::is_action(&value) {
        return match serde_json::from_value::<ActionRequest>(value) {
            Ok(request) => handle_worker_action(hub, worker, request).await,
            Err(e) => decode_failed(worker, &CodecError::from(e)),
        };
    }

    let msg = match codec::decode_any(&value) {
        Ok((msg, _)) => msg,
        Err(e) => return decode_failed(worker, &e),
    };
    if let Some(reply) = ActionResponse::from_message(&msg) {
        FrameOutcome::Reply {
            matched: hub.handle_reply(reply),
        }
    } else if msg.is_heartbeat() {
        FrameOutcome::Heartbeat
    } else {
        debug!(conn_id = worker.id(), kind = %msg.kind(), "ignoring worker event");
        FrameOutcome::Ignored
    }
}

async fn handle_worker_action(
    hub: &Hub,
    worker: &Arc<Connection>,
    request: ActionRequest,
) -> FrameOutcome {
    match request.action.as_str() {
        HEARTBEAT_ACTION => FrameOutcome::Heartbeat,
        REGISTER_CAPABILITIES_ACTION => register_capabilities(hub, worker, request).await,
        _ => {
            forward_to_bot(hub.clone(), Arc::clone(worker), request);
            FrameOutcome::Forwarding
        }
    }
}

async fn register_capabilities(
    hub: &Hub,
    worker: &Arc<Connection>,
    request: ActionRequest,
) -> FrameOutcome {
    let raw = request
        .params
        .get("capabilities")
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));
    let capabilities: Vec<Capability> = match serde_json::from_value(raw) {
        Ok(caps) => caps,
        Err(e) => {
            warn!(conn_id = worker.id(), error = %e, "malformed capability list");
            if request.echo.is_some() {
                let response = ActionResponse::failed(retcode::BAD_REQUEST, e.to_string());
                reply(worker, response.with_echo(request.echo)).await;
            }
            return FrameOutcome::Invalid;
        }
    };

    let count = capabilities.len();
    let response = match hub.set_capabilities(worker.id(), capabilities) {
        Ok(()) => ActionResponse::ok(json!({ "count": count })),
        Err(e) => ActionResponse::failed(retcode_for(&e), e.to_string()),
    };
    if request.echo.is_some() {
        reply(worker, response.with_echo(request.echo)).await;
    }
    FrameOutcome::Capabilities(count)
}

/// Call a bot on behalf of `worker` and send the bot's response back with
/// the worker's own echo. `params.self_id` picks the bot; without it the
/// first live bot is used.
fn forward_to_bot(hub: Hub, worker: Arc<Connection>, mut request: ActionRequest) {
    let echo = request.echo.take();
    let bot_id = request.param_str("self_id");
    let span = info_span!("forward", conn_id = worker.id(), action = %request.action);
    let _ = tokio::spawn(
        async move {
            let response = match hub.call_bot(bot_id.as_deref(), request, None).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "forwarded action failed");
                    ActionResponse::failed(retcode_for(&e), e.to_string())
                }
            };
            reply(&worker, response.with_echo(echo)).await;
        }
        .instrument(span),
    );
}

async fn reply(conn: &Connection, response: ActionResponse) {
    let frame = codec::encode_string(&response.to_message(), conn.dialect());
    if let Err(e) = conn.send(frame).await {
        debug!(conn_id = conn.id(), error = %e, "reply write failed");
    }
}

/// Return code reported to a worker for a hub-side failure.
pub fn retcode_for(error: &HubError) -> i64 {
    match error {
        HubError::ConnectionLost { .. }
        | HubError::NoTargetAvailable { .. }
        | HubError::UnknownConnection { .. } => retcode::UNAVAILABLE,
        HubError::CorrelationTimeout { .. } => retcode::TIMEOUT,
        HubError::Codec(_) => retcode::BAD_REQUEST,
        HubError::RuleStore(_) => retcode::INTERNAL,
    }
}

fn decode_failed(conn: &Connection, error: &CodecError) -> FrameOutcome {
    counter!(DECODE_ERRORS_TOTAL, "kind" => conn.kind().as_str()).increment(1);
    warn!(conn_id = conn.id(), kind = %conn.kind(), error = %error, "dropping undecodable frame");
    FrameOutcome::Invalid
}
