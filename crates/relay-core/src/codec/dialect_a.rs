//! Flat-text dialect envelopes (`post_type`, integer `time`, CQ-string bodies).

use serde_json::{Map, Value};

use crate::action::echo_from_value;
use crate::codec::{
    CodecError, Dialect, collect_extensions, decode_segments, decode_sender, encode_segments,
    extensions_to_map, id_to_value, put, put_opt, require_string, take_i64, take_optional,
    take_string,
};
use crate::message::{
    CanonicalMessage, Envelope, EventBody, MessageEvent, MessageType, MetaEvent, NoticeEvent,
    ResponseEvent, Sender,
};

pub(super) fn encode(msg: &CanonicalMessage) -> Value {
    let mut obj = extensions_to_map(&msg.extensions);
    let env = &msg.envelope;
    if env.time != 0 {
        put(&mut obj, "time", Value::from(env.time));
    }
    if !env.self_id.is_empty() {
        put(&mut obj, "self_id", id_to_value(&env.self_id));
    }
    if !env.platform.is_empty() {
        put(&mut obj, "platform", Value::String(env.platform.clone()));
    }

    match &msg.body {
        EventBody::Message(m) => {
            put(&mut obj, "post_type", "message".into());
            put(&mut obj, "message_type", m.message_type.as_str().into());
            put_opt(&mut obj, "sub_type", m.sub_type.as_deref());
            put(&mut obj, "message_id", id_to_value(&m.message_id));
            put(&mut obj, "user_id", id_to_value(&m.user_id));
            if let Some(gid) = &m.group_id {
                put(&mut obj, "group_id", id_to_value(gid));
            }
            let body = encode_segments(&m.segments, Dialect::FlatText);
            put(&mut obj, "raw_message", body.clone());
            put(&mut obj, "message", body);
            let sender = encode_sender(&m.sender, obj.remove("sender"));
            put(&mut obj, "sender", sender);
        }
        EventBody::Meta(meta) => {
            put(&mut obj, "post_type", "meta_event".into());
            put(&mut obj, "meta_event_type", meta.meta_type.clone().into());
            put_opt(&mut obj, "sub_type", meta.sub_type.as_deref());
            if let Some(interval) = meta.interval {
                put(&mut obj, "interval", interval.into());
            }
            if let Some(status) = &meta.status {
                put(&mut obj, "status", status.clone());
            }
        }
        EventBody::Notice(n) => {
            put(&mut obj, "post_type", "notice".into());
            put(&mut obj, "notice_type", n.notice_type.clone().into());
            put_opt(&mut obj, "sub_type", n.sub_type.as_deref());
            if let Some(uid) = &n.user_id {
                put(&mut obj, "user_id", id_to_value(uid));
            }
            if let Some(gid) = &n.group_id {
                put(&mut obj, "group_id", id_to_value(gid));
            }
        }
        EventBody::Response(r) => {
            put(&mut obj, "status", r.status.clone().into());
            put(&mut obj, "retcode", r.retcode.into());
            put(&mut obj, "data", r.data.clone());
            put_opt(&mut obj, "msg", r.message.as_deref());
        }
    }

    if let Some(echo) = &env.echo {
        put(&mut obj, "echo", echo.clone().into());
    }
    Value::Object(obj)
}

/// Typed sender fields are laid over any `sender` object from the
/// extension bag.
fn encode_sender(sender: &Sender, base: Option<Value>) -> Value {
    let mut obj = match base {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    put(&mut obj, "user_id", id_to_value(&sender.user_id));
    put_opt(&mut obj, "nickname", sender.nickname.as_deref());
    put_opt(&mut obj, "card", sender.card.as_deref());
    put_opt(&mut obj, "avatar", sender.avatar.as_deref());
    Value::Object(obj)
}

pub(super) fn decode(value: &Value) -> Result<CanonicalMessage, CodecError> {
    let mut obj = value.as_object().cloned().ok_or(CodecError::InvalidField {
        field: "event",
        expected: "object",
    })?;

    let echo = obj.remove("echo").as_ref().and_then(echo_from_value);
    let envelope = Envelope {
        self_id: take_string(&mut obj, "self_id").unwrap_or_default(),
        platform: take_string(&mut obj, "platform").unwrap_or_default(),
        time: take_i64(&mut obj, "time")?.unwrap_or(0),
        echo,
    };

    let post_type = take_string(&mut obj, "post_type");
    let body = match post_type.as_deref() {
        Some("message") => EventBody::Message(decode_message(&mut obj)?),
        Some("meta_event") => EventBody::Meta(MetaEvent {
            meta_type: require_string(&mut obj, "meta_event_type")?,
            sub_type: take_optional(&mut obj, "sub_type"),
            interval: take_i64(&mut obj, "interval")?.map(|i| i.max(0) as u64),
            status: obj.remove("status"),
        }),
        Some("notice") => EventBody::Notice(NoticeEvent {
            notice_type: require_string(&mut obj, "notice_type")?,
            sub_type: take_optional(&mut obj, "sub_type"),
            user_id: take_optional(&mut obj, "user_id"),
            group_id: take_optional(&mut obj, "group_id"),
        }),
        Some(other) => return Err(CodecError::UnknownEvent(other.to_string())),
        None if obj.contains_key("retcode") || obj.contains_key("status") => {
            EventBody::Response(decode_response(&mut obj)?)
        }
        None => return Err(CodecError::MissingField("post_type")),
    };

    Ok(CanonicalMessage {
        envelope,
        body,
        extensions: collect_extensions(obj),
    })
}

fn decode_message(obj: &mut Map<String, Value>) -> Result<MessageEvent, CodecError> {
    let message_type = MessageType::parse(&require_string(obj, "message_type")?);
    let sub_type = take_optional(obj, "sub_type");
    let message_id = take_string(obj, "message_id").unwrap_or_default();
    let user_id = require_string(obj, "user_id")?;
    let group_id = take_optional(obj, "group_id");
    let body = obj.remove("message").ok_or(CodecError::MissingField("message"))?;
    let segments = decode_segments(&body)?;
    let _ = obj.remove("raw_message");
    let sender = decode_sender(obj.remove("sender"), &user_id, obj);
    Ok(MessageEvent {
        message_id,
        message_type,
        sub_type,
        user_id,
        group_id,
        sender,
        segments,
    })
}

fn decode_response(obj: &mut Map<String, Value>) -> Result<ResponseEvent, CodecError> {
    let msg = take_string(obj, "msg");
    let wording = take_string(obj, "wording");
    let message = take_string(obj, "message");
    Ok(ResponseEvent {
        status: take_string(obj, "status").unwrap_or_else(|| "ok".to_string()),
        retcode: take_i64(obj, "retcode")?.unwrap_or(0),
        data: obj.remove("data").unwrap_or(Value::Null),
        message: msg.or(wording).or(message).filter(|s| !s.is_empty()),
    })
}
