//! Dialect-neutral message model.
//!
//! A [`CanonicalMessage`] is an [`Envelope`] (who sent it, when, and the echo
//! token) plus an [`EventBody`] tagged union. Message events carry an ordered
//! list of typed [`Segment`]s. Keys the codec does not recognise are kept in a
//! bounded [`Extensions`] bag so they survive a decode/encode cycle.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

/// Maximum number of entries kept in an [`Extensions`] bag.
pub const MAX_EXTENSION_KEYS: usize = 64;

/// Common fields shared by every event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    /// Account id of the bot that produced the event.
    pub self_id: String,
    /// Chat platform name (may be empty when the dialect does not carry it).
    pub platform: String,
    /// Unix timestamp in seconds.
    pub time: i64,
    /// Correlation token, present on responses and echoed requests.
    pub echo: Option<String>,
}

/// Discriminant of an [`EventBody`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Chat message.
    Message,
    /// Heartbeat / lifecycle.
    Meta,
    /// Platform notice (member joined, recall, ...).
    Notice,
    /// Reply to an action request.
    Response,
}

impl EventKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Meta => "meta",
            Self::Notice => "notice",
            Self::Response => "response",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation type of a message event.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// One-to-one conversation.
    Private,
    /// Group conversation.
    Group,
    /// Anything else a connector reports (channel, guild, ...).
    Other(String),
}

impl MessageType {
    /// Parse a wire value. Unknown values are kept verbatim.
    pub fn parse(s: &str) -> Self {
        match s {
            "private" => Self::Private,
            "group" => Self::Group,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Other(s) => s,
        }
    }
}

/// Sender profile attached to a message event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sender {
    /// Sender account id.
    pub user_id: String,
    /// Display name.
    pub nickname: Option<String>,
    /// Group card (per-group display name).
    pub card: Option<String>,
    /// Avatar URL.
    pub avatar: Option<String>,
}

/// Segment type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Literal text run.
    Text,
    /// Image.
    Image,
    /// File attachment.
    File,
    /// Mention of a user (`at` in the flat dialect).
    Mention,
    /// Quote of an earlier message.
    Reply,
    /// Platform emoji.
    Face,
    /// Voice recording.
    Record,
    /// Video.
    Video,
    /// Unrecognised type, kept verbatim.
    Other(String),
}

impl SegmentKind {
    /// Canonical name (the structured dialect uses these directly).
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Mention => "mention",
            Self::Reply => "reply",
            Self::Face => "face",
            Self::Record => "record",
            Self::Video => "video",
            Self::Other(s) => s,
        }
    }

    /// Parse a canonical or flat-dialect name.
    pub fn parse(s: &str) -> Self {
        match s {
            "text" => Self::Text,
            "image" => Self::Image,
            "file" => Self::File,
            "mention" | "at" => Self::Mention,
            "reply" => Self::Reply,
            "face" => Self::Face,
            "record" | "voice" => Self::Record,
            "video" => Self::Video,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One typed piece of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Segment type.
    pub kind: SegmentKind,
    /// Key-value payload using canonical key names.
    pub data: BTreeMap<String, String>,
}

impl Segment {
    /// Empty segment of the given kind.
    pub fn new(kind: SegmentKind) -> Self {
        Self {
            kind,
            data: BTreeMap::new(),
        }
    }

    /// Text segment.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(SegmentKind::Text).with("text", text)
    }

    /// Mention segment.
    pub fn mention(user_id: impl Into<String>) -> Self {
        Self::new(SegmentKind::Mention).with("user_id", user_id)
    }

    /// Image segment referring to a file or URL.
    pub fn image(file: impl Into<String>) -> Self {
        Self::new(SegmentKind::Image).with("file", file)
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.data.insert(key.into(), value.into());
        self
    }

    /// Payload value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

/// Concatenated text of all text segments.
pub fn plain_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter(|s| s.kind == SegmentKind::Text)
        .filter_map(|s| s.get("text"))
        .collect()
}

/// Bounded bag of unrecognised top-level keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extensions(BTreeMap<String, Value>);

impl Extensions {
    /// Empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry. Returns `false` if the bag is full and
    /// `key` is not already present.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if self.0.len() >= MAX_EXTENSION_KEYS && !self.0.contains_key(&key) {
            return false;
        }
        let _ = self.0.insert(key, value);
        true
    }

    /// Look up an entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Chat message event.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageEvent {
    /// Platform message id.
    pub message_id: String,
    /// Conversation type.
    pub message_type: MessageType,
    /// Sub type (`friend`, `normal`, ...).
    pub sub_type: Option<String>,
    /// Author account id.
    pub user_id: String,
    /// Group id for group conversations.
    pub group_id: Option<String>,
    /// Author profile.
    pub sender: Sender,
    /// Ordered message content.
    pub segments: Vec<Segment>,
}

/// Heartbeat or lifecycle event.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaEvent {
    /// `heartbeat`, `lifecycle`, ...
    pub meta_type: String,
    /// Sub type (`connect`, `enable`, ...).
    pub sub_type: Option<String>,
    /// Heartbeat interval in milliseconds.
    pub interval: Option<u64>,
    /// Connector status object.
    pub status: Option<Value>,
}

/// Platform notice.
#[derive(Clone, Debug, PartialEq)]
pub struct NoticeEvent {
    /// Notice type (`group_increase`, `friend_recall`, ...).
    pub notice_type: String,
    /// Sub type.
    pub sub_type: Option<String>,
    /// Subject account, if any.
    pub user_id: Option<String>,
    /// Group, if any.
    pub group_id: Option<String>,
}

/// Reply to an action request.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseEvent {
    /// `ok` or `failed`.
    pub status: String,
    /// Zero on success.
    pub retcode: i64,
    /// Result payload.
    pub data: Value,
    /// Human-readable error message.
    pub message: Option<String>,
}

/// Event payload.
#[derive(Clone, Debug, PartialEq)]
pub enum EventBody {
    /// Chat message.
    Message(MessageEvent),
    /// Heartbeat / lifecycle.
    Meta(MetaEvent),
    /// Platform notice.
    Notice(NoticeEvent),
    /// Reply to an action.
    Response(ResponseEvent),
}

/// Dialect-neutral event.
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalMessage {
    /// Common envelope.
    pub envelope: Envelope,
    /// Typed payload.
    pub body: EventBody,
    /// Unrecognised top-level keys.
    pub extensions: Extensions,
}

impl CanonicalMessage {
    /// Build a message with an empty extension bag.
    pub fn new(envelope: Envelope, body: EventBody) -> Self {
        Self {
            envelope,
            body,
            extensions: Extensions::new(),
        }
    }

    /// Event discriminant.
    pub fn kind(&self) -> EventKind {
        match self.body {
            EventBody::Message(_) => EventKind::Message,
            EventBody::Meta(_) => EventKind::Meta,
            EventBody::Notice(_) => EventKind::Notice,
            EventBody::Response(_) => EventKind::Response,
        }
    }

    /// Whether this is a heartbeat meta event.
    pub fn is_heartbeat(&self) -> bool {
        matches!(&self.body, EventBody::Meta(meta) if meta.meta_type == "heartbeat")
    }

    /// Message payload, if this is a message event.
    pub fn as_message(&self) -> Option<&MessageEvent> {
        match &self.body {
            EventBody::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Key used to match routing rules.
    ///
    /// Group traffic routes as `grp:{group_id}`, private traffic as
    /// `usr:{user_id}`, everything else as `bot:{self_id}`.
    pub fn routing_key(&self) -> String {
        match &self.body {
            EventBody::Message(m) => match &m.group_id {
                Some(gid) if m.message_type != MessageType::Private => format!("grp:{gid}"),
                _ => format!("usr:{}", m.user_id),
            },
            EventBody::Notice(n) => match (&n.group_id, &n.user_id) {
                (Some(gid), _) => format!("grp:{gid}"),
                (None, Some(uid)) => format!("usr:{uid}"),
                (None, None) => format!("bot:{}", self.envelope.self_id),
            },
            _ => format!("bot:{}", self.envelope.self_id),
        }
    }
}
