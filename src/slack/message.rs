//! RTM wire messages.
//!
//! Inbound frames are deserialized leniently: any recognised field whose wire
//! value is not a string (Slack sends a `user` object in `user_change`
//! events, for example) is treated as absent instead of failing the frame.

use serde::{Deserialize, Deserializer, Serialize};

use crate::{AppError, Result};

/// An event frame received from the RTM socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    /// Event type tag (`message`, `hello`, `presence_change`, …).
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub kind: Option<String>,
    /// Channel id.
    #[serde(default, deserialize_with = "lenient_string")]
    pub channel: Option<String>,
    /// Author's user id.
    #[serde(default, deserialize_with = "lenient_string")]
    pub user: Option<String>,
    /// Message body.
    #[serde(default, deserialize_with = "lenient_string")]
    pub text: Option<String>,
    /// Slack timestamp (`ts`).
    #[serde(rename = "ts", default, deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
    /// Workspace id.
    #[serde(default, deserialize_with = "lenient_string")]
    pub team: Option<String>,
    /// Present on acknowledgements of frames this client sent.
    #[serde(default)]
    pub reply_to: Option<serde_json::Value>,
}

impl InboundMessage {
    /// Parse one text frame. `Ok(None)` for a JSON `null` frame.
    ///
    /// # Errors
    ///
    /// Returns `AppError::FrameParse` when the frame is not a JSON object.
    pub fn parse(frame: &str) -> Result<Option<Self>> {
        serde_json::from_str::<Option<Self>>(frame)
            .map_err(|err| AppError::FrameParse(format!("malformed frame: {err}")))
    }

    /// `true` when this is a user-authored message in a direct-message
    /// channel, i.e. something the bot should answer.
    #[must_use]
    pub fn is_direct_message(&self, channel_prefix: &str) -> bool {
        self.kind.as_deref() == Some("message")
            && self
                .channel
                .as_deref()
                .is_some_and(|channel| !channel.is_empty() && channel.starts_with(channel_prefix))
            && self.user.is_some()
            && self.text.is_some()
            && self.reply_to.is_none()
    }
}

/// A frame queued for the RTM socket. `id` is stamped by the send task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Frame type (`message` or `ping`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Target channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Per-connection sequence id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl OutboundMessage {
    /// A chat message answering `to` in the same channel.
    #[must_use]
    pub fn reply(to: &InboundMessage, text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_owned(),
            channel: to.channel.clone(),
            text: Some(text.into()),
            id: None,
        }
    }

    /// A keepalive frame.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            kind: "ping".to_owned(),
            channel: None,
            text: None,
            id: None,
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    })
}
