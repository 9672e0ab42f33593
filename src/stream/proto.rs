use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Builds a channel name following the `<resource>:<scope>:<identifier>`
/// convention used by the push service.
pub fn channel_name(resource: &str, scope: &str, identifier: &str) -> String {
    format!("{resource}:{scope}:{identifier}")
}

/// Wire unit exchanged in both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "i")]
    pub id: String,
    #[serde(rename = "t")]
    pub kind: String,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn frame_kind(&self) -> FrameKind {
        FrameKind::from(self.kind.as_str())
    }

    /// Whether this frame may advance the last-seen message id.
    pub fn carries_application_data(&self) -> bool {
        !matches!(self.frame_kind(), FrameKind::Ack | FrameKind::Error)
    }
}

/// Known frame type tags. Anything else is an application message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Join,
    Leave,
    Filter,
    Auth,
    Replay,
    Ping,
    Ack,
    Error,
    Other(String),
}

impl FrameKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Filter => "filter",
            Self::Auth => "auth",
            Self::Replay => "replay",
            Self::Ping => "ping",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Other(kind) => kind,
        }
    }
}

impl From<&str> for FrameKind {
    fn from(value: &str) -> Self {
        match value {
            "join" => Self::Join,
            "leave" => Self::Leave,
            "filter" => Self::Filter,
            "auth" => Self::Auth,
            "replay" => Self::Replay,
            "ping" => Self::Ping,
            "ack" => Self::Ack,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TagTypeMode {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklist: Option<Vec<String>>,
}

/// Server-side filter configuration for one filter type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    pub tag_type_mode: TagTypeMode,
    #[serde(default)]
    pub tags: ListFilter,
    #[serde(default)]
    pub types: ListFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterRequest {
    #[serde(rename = "type")]
    pub filter_type: String,
    pub filter: FilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayRequest {
    pub channels: Vec<String>,
    pub start: String,
}

/// Outbound request before it is stamped with a correlation id.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Join { channels: Vec<String> },
    Leave { channels: Vec<String> },
    Filter(FilterRequest),
    Auth { credential: SecretString },
    Replay(ReplayRequest),
    Ping,
}

impl ClientFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Join { .. } => FrameKind::Join,
            Self::Leave { .. } => FrameKind::Leave,
            Self::Filter(_) => FrameKind::Filter,
            Self::Auth { .. } => FrameKind::Auth,
            Self::Replay(_) => FrameKind::Replay,
            Self::Ping => FrameKind::Ping,
        }
    }

    pub fn into_envelope(self, id: String) -> Result<Envelope, serde_json::Error> {
        let kind = self.kind().as_str().to_string();
        let payload = match self {
            Self::Join { channels } | Self::Leave { channels } => Some(serde_json::to_value(channels)?),
            Self::Filter(request) => Some(serde_json::to_value(request)?),
            Self::Auth { credential } => Some(Value::String(credential.expose_secret().clone())),
            Self::Replay(request) => Some(serde_json::to_value(request)?),
            Self::Ping => None,
        };
        Ok(Envelope {
            id,
            kind,
            channel: None,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_uses_short_wire_keys() {
        let envelope = Envelope {
            id: "7".to_string(),
            kind: "issue_updated".to_string(),
            channel: Some(channel_name("repo", "team", "42")),
            payload: Some(json!({"title": "x"})),
        };
        let value: Value = serde_json::from_str(&envelope.to_text().expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({"i": "7", "t": "issue_updated", "c": "repo:team:42", "p": {"title": "x"}})
        );
    }

    #[test]
    fn envelope_decodes_without_channel_or_payload() {
        let envelope = Envelope::from_text(r#"{"i":"a1","t":"ack"}"#).expect("decode");
        assert_eq!(envelope.channel, None);
        assert_eq!(envelope.payload, None);
        assert_eq!(envelope.frame_kind(), FrameKind::Ack);
        assert!(!envelope.carries_application_data());
    }

    #[test]
    fn malformed_envelope_is_a_decode_error() {
        assert!(Envelope::from_text("{not json").is_err());
        assert!(Envelope::from_text(r#"{"t":"ping"}"#).is_err());
    }

    #[test]
    fn unknown_kinds_are_application_frames() {
        let envelope = Envelope::from_text(r#"{"i":"m","t":"build_finished","p":1}"#).expect("decode");
        assert_eq!(
            envelope.frame_kind(),
            FrameKind::Other("build_finished".to_string())
        );
        assert!(envelope.carries_application_data());
    }

    #[test]
    fn ping_frame_has_no_payload() {
        let envelope = ClientFrame::Ping.into_envelope("1".to_string()).expect("envelope");
        assert_eq!(envelope.to_text().expect("encode"), r#"{"i":"1","t":"ping"}"#);
    }

    #[test]
    fn filter_frame_payload_matches_wire_shape() {
        let request = FilterRequest {
            filter_type: "activity".to_string(),
            filter: FilterConfig {
                tag_type_mode: TagTypeMode::Or,
                tags: ListFilter {
                    whitelist: Some(vec!["urgent".to_string()]),
                    blacklist: None,
                },
                types: ListFilter::default(),
            },
        };
        let envelope = ClientFrame::Filter(request)
            .into_envelope("9".to_string())
            .expect("envelope");
        assert_eq!(envelope.kind, "filter");
        assert_eq!(
            envelope.payload,
            Some(json!({
                "type": "activity",
                "filter": {"tagTypeMode": "or", "tags": {"whitelist": ["urgent"]}, "types": {}}
            }))
        );
    }

    #[test]
    fn auth_and_replay_payloads() {
        let auth = ClientFrame::Auth {
            credential: SecretString::new("token-1".to_string()),
        }
        .into_envelope("2".to_string())
        .expect("envelope");
        assert_eq!(auth.payload, Some(json!("token-1")));

        let replay = ClientFrame::Replay(ReplayRequest {
            channels: vec!["a:b:c".to_string()],
            start: "m-41".to_string(),
        })
        .into_envelope("3".to_string())
        .expect("envelope");
        assert_eq!(replay.kind, "replay");
        assert_eq!(
            replay.payload,
            Some(json!({"channels": ["a:b:c"], "start": "m-41"}))
        );
    }
}
