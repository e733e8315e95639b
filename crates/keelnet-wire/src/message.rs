//! Wire protocol message types.
//!
//! All communication between keelnet peers uses JSON-framed messages over
//! TCP. Each message is prefixed with a 4-byte big-endian length header.
//! Requests and responses are correlated by [`RequestId`]; notifications are
//! fire-and-forget; an [`EncryptedEnvelope`] carries another message's
//! serialized bytes under the connection's session cipher.

use crate::error::WireError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation identifier linking a request to its response.
pub type RequestId = Uuid;

/// Default maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// A wire protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Expects a correlated [`Response`].
    Request(Request),
    /// Answer to a [`Request`], carrying its id.
    Response(Response),
    /// One-way message (no response expected).
    Notification(Notification),
    /// Another message, serialized and encrypted with the session cipher.
    Encrypted(EncryptedEnvelope),
}

impl Message {
    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Notification(_) => "notification",
            Message::Encrypted(_) => "encrypted",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }
}

/// A correlatable request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Unique request ID, echoed by the response.
    pub id: RequestId,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl Request {
    /// Wrap a body with a fresh random identifier.
    pub fn new(body: impl Into<RequestBody>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body: body.into(),
        }
    }
}

/// Request payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RequestBody {
    /// Heartbeat.
    Ping(PingRequest),
    /// Handshake: carry a public key, ask for a symmetric session key.
    KeyExchange(KeyExchangeRequest),
    /// Application-defined request.
    Custom(CustomRequest),
}

/// A response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// ID of the request this answers.
    pub id: RequestId,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    pub fn new(id: RequestId, body: impl Into<ResponseBody>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }
}

/// Response payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ResponseBody {
    Ping(PingResponse),
    KeyExchange(KeyExchangeResponse),
    Custom(CustomResponse),
}

/// Notification messages (one-way, no response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// The sender is closing the connection on purpose.
    Goodbye,
    /// Application-defined notification.
    Custom(CustomNotification),
}

impl Notification {
    pub fn custom(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Notification::Custom(CustomNotification {
            name: name.into(),
            payload,
        })
    }
}

/// Heartbeat request; the responder echoes the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub timestamp: DateTime<Utc>,
}

impl PingRequest {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub timestamp: DateTime<Utc>,
}

/// Public half of the initiator's asymmetric keypair plus the wanted
/// symmetric key size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyExchangeRequest {
    pub asymmetric_key_bits: u32,
    pub symmetric_key_bits: u32,
    /// Big-endian public exponent.
    #[serde(with = "base64_bytes")]
    pub public_exponent: Vec<u8>,
    /// Big-endian public modulus.
    #[serde(with = "base64_bytes")]
    pub public_modulus: Vec<u8>,
}

/// Symmetric key and IV, each encrypted under the requester's public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyExchangeResponse {
    pub accepted: bool,
    #[serde(with = "base64_bytes")]
    pub encrypted_symmetric_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub encrypted_symmetric_iv: Vec<u8>,
}

impl KeyExchangeResponse {
    pub fn rejected() -> Self {
        Self {
            accepted: false,
            encrypted_symmetric_key: Vec::new(),
            encrypted_symmetric_iv: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomRequest {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CustomRequest {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomResponse {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomNotification {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Encrypted form of another [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl From<PingRequest> for RequestBody {
    fn from(value: PingRequest) -> Self {
        RequestBody::Ping(value)
    }
}

impl From<KeyExchangeRequest> for RequestBody {
    fn from(value: KeyExchangeRequest) -> Self {
        RequestBody::KeyExchange(value)
    }
}

impl From<CustomRequest> for RequestBody {
    fn from(value: CustomRequest) -> Self {
        RequestBody::Custom(value)
    }
}

impl From<PingResponse> for ResponseBody {
    fn from(value: PingResponse) -> Self {
        ResponseBody::Ping(value)
    }
}

impl From<KeyExchangeResponse> for ResponseBody {
    fn from(value: KeyExchangeResponse) -> Self {
        ResponseBody::KeyExchange(value)
    }
}

impl From<CustomResponse> for ResponseBody {
    fn from(value: CustomResponse) -> Self {
        ResponseBody::Custom(value)
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Message::Notification(value)
    }
}

impl From<EncryptedEnvelope> for Message {
    fn from(value: EncryptedEnvelope) -> Self {
        Message::Encrypted(value)
    }
}

/// Serialize a message body without the length prefix.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
///
/// Fails with [`WireError::MessageTooLarge`] when the body exceeds `max_size`,
/// before anything is written.
pub fn encode_message(msg: &Message, max_size: u32) -> Result<Vec<u8>, WireError> {
    let json = serialize_message(msg)?;
    let len = match u32::try_from(json.len()) {
        Ok(len) if len <= max_size => len,
        _ => {
            return Err(WireError::MessageTooLarge {
                size: u32::try_from(json.len()).unwrap_or(u32::MAX),
                max: max_size,
            })
        }
    };
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a Message.
pub fn decode_message(body: &[u8]) -> Result<Message, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Byte fields travel as base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
