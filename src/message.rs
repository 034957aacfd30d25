//! JSON payloads carried inside frames
//!
//! Server-facing methods carry [`Request`] / [`Response`] bodies, peer-facing
//! methods carry a [`Message`].

use crate::{
    error::{Result, SerializationError},
    network::{Peer, PeerId},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Status code of a registry [`Response`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    Success,
    InvalidParam,
    InternalError,
    NotFound,
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Success => 1,
            StatusCode::InvalidParam => 2,
            StatusCode::InternalError => 3,
            StatusCode::NotFound => 4,
        }
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = String;

    fn try_from(code: u16) -> std::result::Result<Self, Self::Error> {
        match code {
            1 => Ok(StatusCode::Success),
            2 => Ok(StatusCode::InvalidParam),
            3 => Ok(StatusCode::InternalError),
            4 => Ok(StatusCode::NotFound),
            other => Err(format!("unknown status code {other}")),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Success => "success",
            StatusCode::InvalidParam => "invalid-param",
            StatusCode::InternalError => "internal-error",
            StatusCode::NotFound => "not-found",
        };
        f.write_str(name)
    }
}

/// Request sent to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Id of the requesting peer
    pub id: PeerId,
    #[serde(default)]
    pub body: String,
}

impl Request {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            body: String::new(),
        }
    }

    pub fn with_body(id: PeerId, body: impl Into<String>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }
}

/// Registry answer to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub code: StatusCode,
    #[serde(default)]
    pub body: String,
}

impl Response {
    pub fn success(body: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Success,
            body: body.into(),
        }
    }

    pub fn error(code: StatusCode, body: impl Into<String>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }
}

/// Application message delivered directly between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Sender descriptor, so the receiver can reply without asking the registry
    pub from_peer: Peer,
}

impl Message {
    pub fn new(data: impl Into<Vec<u8>>, from_peer: Peer) -> Self {
        Self {
            data: data.into(),
            from_peer,
        }
    }

    /// Payload rendered as text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Serialize any payload type to its JSON bytes
pub fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value).map_err(SerializationError::Json)?)
}

/// Deserialize a payload type from JSON bytes
pub fn from_json_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes).map_err(SerializationError::Json)?)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_is_a_wire_number() {
        let json = serde_json::to_string(&Response::error(StatusCode::NotFound, "x")).unwrap();
        assert_eq!(json, r#"{"code":4,"body":"x"}"#);

        let bad: std::result::Result<Response, _> = serde_json::from_str(r#"{"code":9,"body":""}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn message_payload_is_base64() {
        let msg = Message::new(b"ping".to_vec(), Peer::unresolved(PeerId::new(7)));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["data"], "cGluZw==");
        assert_eq!(json["from_peer"]["id"], 7);

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.text(), "ping");
    }

    #[test]
    fn request_body_defaults_to_empty() {
        let req: Request = serde_json::from_str(r#"{"id":123}"#).unwrap();
        assert_eq!(req, Request::new(PeerId::new(123)));
    }
}
