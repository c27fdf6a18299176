//! Structured dialect envelopes (`type`/`detail_type`, float `time`, `self`
//! object, segment arrays).

use serde_json::{Map, Value};

use crate::action::echo_from_value;
use crate::codec::{
    CodecError, Dialect, collect_extensions, decode_segments, decode_sender, encode_segments,
    extensions_to_map, put, put_opt, require_string, take_i64, take_optional, take_string,
};
use crate::message::{
    CanonicalMessage, Envelope, EventBody, MessageEvent, MessageType, MetaEvent, NoticeEvent,
    ResponseEvent, plain_text,
};

pub(super) fn encode(msg: &CanonicalMessage) -> Value {
    let mut obj = extensions_to_map(&msg.extensions);
    let env = &msg.envelope;

    if !matches!(msg.body, EventBody::Response(_)) {
        put(&mut obj, "time", Value::from(env.time as f64));
        let mut self_obj = match obj.remove("self") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        put(&mut self_obj, "platform", env.platform.clone().into());
        put(&mut self_obj, "user_id", env.self_id.clone().into());
        put(&mut obj, "self", Value::Object(self_obj));
    }

    match &msg.body {
        EventBody::Message(m) => {
            put(&mut obj, "type", "message".into());
            put(&mut obj, "detail_type", m.message_type.as_str().into());
            put(&mut obj, "sub_type", m.sub_type.clone().unwrap_or_default().into());
            put(&mut obj, "message_id", m.message_id.clone().into());
            put(&mut obj, "user_id", m.user_id.clone().into());
            if let Some(gid) = &m.group_id {
                put(&mut obj, "group_id", gid.clone().into());
            }
            put(
                &mut obj,
                "message",
                encode_segments(&m.segments, Dialect::Structured),
            );
            put(&mut obj, "alt_message", plain_text(&m.segments).into());
            let mut sender = match obj.remove("sender") {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            put(&mut sender, "user_id", m.sender.user_id.clone().into());
            put_opt(&mut sender, "nickname", m.sender.nickname.as_deref());
            put_opt(&mut sender, "card", m.sender.card.as_deref());
            put_opt(&mut sender, "avatar", m.sender.avatar.as_deref());
            put(&mut obj, "sender", Value::Object(sender));
        }
        EventBody::Meta(meta) => {
            put(&mut obj, "type", "meta".into());
            put(&mut obj, "detail_type", meta.meta_type.clone().into());
            put(&mut obj, "sub_type", meta.sub_type.clone().unwrap_or_default().into());
            if let Some(interval) = meta.interval {
                put(&mut obj, "interval", interval.into());
            }
            if let Some(status) = &meta.status {
                put(&mut obj, "status", status.clone());
            }
        }
        EventBody::Notice(n) => {
            put(&mut obj, "type", "notice".into());
            put(&mut obj, "detail_type", n.notice_type.clone().into());
            put(&mut obj, "sub_type", n.sub_type.clone().unwrap_or_default().into());
            put_opt(&mut obj, "user_id", n.user_id.as_deref());
            put_opt(&mut obj, "group_id", n.group_id.as_deref());
        }
        EventBody::Response(r) => {
            put(&mut obj, "status", r.status.clone().into());
            put(&mut obj, "retcode", r.retcode.into());
            put(&mut obj, "data", r.data.clone());
            put(&mut obj, "message", r.message.clone().unwrap_or_default().into());
        }
    }

    if let Some(echo) = &env.echo {
        put(&mut obj, "echo", echo.clone().into());
    }
    Value::Object(obj)
}

pub(super) fn decode(value: &Value) -> Result<CanonicalMessage, CodecError> {
    let mut obj = value.as_object().cloned().ok_or(CodecError::InvalidField {
        field: "event",
        expected: "object",
    })?;

    let echo = obj.remove("echo").as_ref().and_then(echo_from_value);
    let (self_id, platform) = match obj.remove("self") {
        Some(Value::Object(mut s)) => (
            take_string(&mut s, "user_id").unwrap_or_default(),
            take_string(&mut s, "platform").unwrap_or_default(),
        ),
        Some(Value::Null) | None => (String::new(), String::new()),
        Some(_) => {
            return Err(CodecError::InvalidField {
                field: "self",
                expected: "object",
            });
        }
    };
    let envelope = Envelope {
        self_id,
        platform,
        time: take_i64(&mut obj, "time")?.unwrap_or(0),
        echo,
    };

    let event_type = take_string(&mut obj, "type");
    let body = match event_type.as_deref() {
        Some("message") => EventBody::Message(decode_message(&mut obj)?),
        Some("meta") => EventBody::Meta(MetaEvent {
            meta_type: require_string(&mut obj, "detail_type")?,
            sub_type: take_optional(&mut obj, "sub_type"),
            interval: take_i64(&mut obj, "interval")?.map(|i| i.max(0) as u64),
            status: obj.remove("status"),
        }),
        Some("notice") => EventBody::Notice(NoticeEvent {
            notice_type: require_string(&mut obj, "detail_type")?,
            sub_type: take_optional(&mut obj, "sub_type"),
            user_id: take_optional(&mut obj, "user_id"),
            group_id: take_optional(&mut obj, "group_id"),
        }),
        Some(other) => return Err(CodecError::UnknownEvent(other.to_string())),
        None if obj.contains_key("retcode") || obj.contains_key("status") => {
            EventBody::Response(ResponseEvent {
                status: take_string(&mut obj, "status").unwrap_or_else(|| "ok".to_string()),
                retcode: take_i64(&mut obj, "retcode")?.unwrap_or(0),
                data: obj.remove("data").unwrap_or(Value::Null),
                message: take_optional(&mut obj, "message"),
            })
        }
        None => return Err(CodecError::MissingField("type")),
    };

    Ok(CanonicalMessage {
        envelope,
        body,
        extensions: collect_extensions(obj),
    })
}

fn decode_message(obj: &mut Map<String, Value>) -> Result<MessageEvent, CodecError> {
    let message_type = MessageType::parse(&require_string(obj, "detail_type")?);
    let sub_type = take_optional(obj, "sub_type");
    let message_id = take_string(obj, "message_id").unwrap_or_default();
    let user_id = require_string(obj, "user_id")?;
    let group_id = take_optional(obj, "group_id");
    let body = obj.remove("message").ok_or(CodecError::MissingField("message"))?;
    let segments = decode_segments(&body)?;
    let _ = obj.remove("alt_message");

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
