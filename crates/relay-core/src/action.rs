//! `{action, params, echo}` command envelopes and their responses.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::message::{CanonicalMessage, Envelope, EventBody, ResponseEvent};

/// Return codes used by responses the hub synthesises itself.
pub mod retcode {
    /// Success.
    pub const OK: i64 = 0;
    /// Malformed request.
    pub const BAD_REQUEST: i64 = 1400;
    /// No bot or worker could take the request.
    pub const UNAVAILABLE: i64 = 1404;
    /// Hub-side failure.
    pub const INTERNAL: i64 = 1500;
    /// No reply before the deadline.
    pub const TIMEOUT: i64 = 1504;
}

/// Outbound command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Action name (`send_msg`, `get_group_list`, ...).
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub params: Value,
    /// Correlation token.
    #[serde(
        default,
        deserialize_with = "lenient_echo",
        skip_serializing_if = "Option::is_none"
    )]
    pub echo: Option<String>,
}

impl ActionRequest {
    /// Request without an echo token.
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
            echo: None,
        }
    }

    /// Replace the echo token.
    #[must_use]
    pub fn with_echo(mut self, echo: impl Into<String>) -> Self {
        self.echo = Some(echo.into());
        self
    }

    /// String parameter, accepting numbers as well.
    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Reply to an [`ActionRequest`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActionResponse {
    /// `ok` or `failed`.
    pub status: String,
    /// Zero on success.
    pub retcode: i64,
    /// Result payload.
    pub data: Value,
    /// Error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Echo of the request token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<String>,
}

impl ActionResponse {
    /// Successful response.
    pub fn ok(data: Value) -> Self {
        Self {
            status: "ok".into(),
            retcode: retcode::OK,
            data,
            message: None,
            echo: None,
        }
    }

    /// Failed response.
    pub fn failed(code: i64, message: impl Into<String>) -> Self {
        Self {
            status: "failed".into(),
            retcode: code,
            data: Value::Null,
            message: Some(message.into()),
            echo: None,
        }
    }

    /// Replace the echo token.
    #[must_use]
    pub fn with_echo(mut self, echo: Option<String>) -> Self {
        self.echo = echo;
        self
    }

    /// Whether the remote side reported success.
    pub fn is_ok(&self) -> bool {
        self.retcode == retcode::OK && self.status != "failed"
    }

    /// Extract a response from a decoded event.
    pub fn from_message(msg: &CanonicalMessage) -> Option<Self> {
        match &msg.body {
            EventBody::Response(r) => Some(Self {
                status: r.status.clone(),
                retcode: r.retcode,
                data: r.data.clone(),
                message: r.message.clone(),
                echo: msg.envelope.echo.clone(),
            }),
            _ => None,
        }
    }

    /// Response event carrying this reply, ready for either dialect encoder.
    pub fn to_message(&self) -> CanonicalMessage {
        CanonicalMessage::new(
            Envelope {
                echo: self.echo.clone(),
                ..Envelope::default()
            },
            EventBody::Response(ResponseEvent {
                status: self.status.clone(),
                retcode: self.retcode,
                data: self.data.clone(),
                message: self.message.clone(),
            }),
        )
    }
}

/// Accept string or numeric echo values; anything else is dropped.
pub(crate) fn echo_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_echo<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(echo_from_value))
}
