//! Flat-text segment grammar.
//!
//! ```text
//! message := ( text | tag )*
//! tag     := "[CQ:" type ( "," param )* "]"
//! param   := key ( "=" value )?
//! text    := any run not starting a well-formed tag
//! ```
//!
//! Text runs are escaped with [`escape_text`], parameter values with
//! [`escape_param`]. The tokenizer scans literal text until it sees `[`, then
//! runs a small state machine (`Type` → `Key` ↔ `Value`) over the candidate
//! tag. A candidate that is malformed (unknown opener, nested `[`, empty type,
//! missing `]`) is emitted as literal text instead.
//!
//! Known edge case: parameters are split on every raw comma. A producer that
//! forgets to escape a comma inside a value gets the value cut short, and the
//! remainder becomes a separate key with an empty value.

use crate::codec::escape::{escape_param, escape_text, unescape_param, unescape_text};
use crate::message::{Segment, SegmentKind};

const TAG_OPEN: &str = "[CQ:";

/// Flat-dialect segment type name.
fn flat_name(kind: &SegmentKind) -> &str {
    match kind {
        SegmentKind::Mention => "at",
        other => other.as_str(),
    }
}

/// Canonical key to flat key.
fn to_flat_key<'a>(kind: &SegmentKind, key: &'a str) -> &'a str {
    match (kind, key) {
        (SegmentKind::Mention, "user_id") => "qq",
        (SegmentKind::Reply, "message_id") => "id",
        _ => key,
    }
}

/// Flat key to canonical key.
pub(crate) fn canonical_key(kind: &SegmentKind, key: &str) -> String {
    match (kind, key) {
        (SegmentKind::Mention, "qq") => "user_id".to_string(),
        (SegmentKind::Reply, "id") => "message_id".to_string(),
        _ => key.to_string(),
    }
}

/// Render segments as a flat-text string.
pub fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        if seg.kind == SegmentKind::Text {
            out.push_str(&escape_text(seg.get("text").unwrap_or_default()));
            continue;
        }
        out.push_str(TAG_OPEN);
        out.push_str(&escape_param(flat_name(&seg.kind)));
        for (key, value) in &seg.data {
            out.push(',');
            out.push_str(&escape_param(to_flat_key(&seg.kind, key)));
            out.push('=');
            out.push_str(&escape_param(value));
        }
        out.push(']');
    }
    out
}

/// Parse a flat-text string into segments. Never fails.
pub fn parse(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while let Some(pos) = rest.find('[') {
        literal.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match parse_tag(rest) {
            Some((segment, consumed)) => {
                flush_text(&mut literal, &mut segments);
                segments.push(segment);
                rest = &rest[consumed..];
            }
            None => {
                literal.push('[');
                rest = &rest[1..];
            }
        }
    }
    literal.push_str(rest);
    flush_text(&mut literal, &mut segments);
    segments
}

fn flush_text(literal: &mut String, segments: &mut Vec<Segment>) {
    if !literal.is_empty() {
        segments.push(Segment::text(unescape_text(literal)));
        literal.clear();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Type,
    Key,
    Value,
}

#[derive(Default)]
struct TagBuilder {
    kind: String,
    key: String,
    value: String,
    params: Vec<(String, String)>,
}

impl TagBuilder {
    fn push_param(&mut self) {
        if !self.key.is_empty() {
            self.params.push((
                unescape_param(&self.key),
                unescape_param(&self.value),
            ));
        }
        self.key.clear();
        self.value.clear();
    }

    fn finish(self) -> Segment {
        let kind = SegmentKind::parse(&unescape_param(&self.kind));
        let mut segment = Segment::new(kind);
        for (key, value) in self.params {
            let key = canonical_key(&segment.kind, &key);
            let _ = segment.data.insert(key, value);
        }
        segment
    }
}

/// Try to parse one tag at the start of `s`. Returns the segment and the
/// number of bytes consumed.
fn parse_tag(s: &str) -> Option<(Segment, usize)> {
    let body = s.strip_prefix(TAG_OPEN)?;
    let mut state = State::Type;
    let mut tag = TagBuilder::default();

    for (i, c) in body.char_indices() {
        if c == '[' {
            return None;
        }
        match (state, c) {
            (State::Type, ',' | ']') if tag.kind.is_empty() => return None,
            (State::Type, ',') => state = State::Key,
            (State::Key, '=') => state = State::Value,
            (State::Key | State::Value, ',') => {
                tag.push_param();
                state = State::Key;
            }
            (_, ']') => {
                tag.push_param();
                return Some((tag.finish(), TAG_OPEN.len() + i + 1));
            }
            (State::Type, c) => tag.kind.push(c),
            (State::Key, c) => tag.key.push(c),
            (State::Value, c) => tag.value.push(c),
        }
    }
    None
}
