//! JSON-RPC 2.0 message model and codec.
//!
//! Inbound bytes are parsed to `serde_json::Value` by the transport; this
//! module classifies a value into exactly one [`Message`] variant or rejects
//! it with a [`ProtocolError`]. Classification is by shape, applied in order:
//!
//! 1. `id` present and `result` or `error` present → [`Response`]
//! 2. `id` present and `method` present → [`Request`]
//! 3. `id` absent and `method` present → [`Notification`]
//! 4. anything else → malformed
//!
//! The codec is stateless; both directions work on owned values.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// A request id: a string or an integer, unique within one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Id {
    String(String),
    Integer(i64),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::String(value) => value.fmt(f),
            Id::Integer(value) => value.fmt(f),
        }
    }
}

/// Malformed message or peer invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol error: {message}")]
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) => None,
        }
    }
}

/// An outbound request may leave `id` unset; the connection engine assigns
/// one before the message reaches the transport. Decoded requests always
/// carry an id.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<Id>,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn with_id(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Id,
    pub payload: ResponsePayload,
}

impl Response {
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(value) => Some(value),
            ResponsePayload::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match &self.payload {
            ResponsePayload::Result(_) => None,
            ResponsePayload::Error(error) => Some(error),
        }
    }
}

/// Exactly one of `result` / `error`, enforced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(ErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

/// Encodes a message as a JSON object carrying `"jsonrpc":"2.0"`.
///
/// `params: Some(Value::Null)` is treated the same as absent params.
/// Encoding a [`Request`] whose id is still unset fails; the engine assigns
/// ids before handing messages down.
pub fn encode(message: &Message) -> Result<Value, ProtocolError> {
    let mut map = Map::new();
    map.insert(
        "jsonrpc".to_string(),
        Value::String(JSONRPC_VERSION.to_string()),
    );

    match message {
        Message::Request(request) => {
            let id = request
                .id
                .as_ref()
                .ok_or_else(|| ProtocolError::new("request id not assigned"))?;
            map.insert("id".to_string(), id_value(id));
            map.insert(
                "method".to_string(),
                Value::String(request.method.clone()),
            );
            if let Some(params) = request.params.clone().filter(|v| !v.is_null()) {
                map.insert("params".to_string(), params);
            }
        }
        Message::Notification(notification) => {
            map.insert(
                "method".to_string(),
                Value::String(notification.method.clone()),
            );
            if let Some(params) = notification.params.clone().filter(|v| !v.is_null()) {
                map.insert("params".to_string(), params);
            }
        }
        Message::Response(response) => {
            map.insert("id".to_string(), id_value(&response.id));
            match &response.payload {
                ResponsePayload::Result(result) => {
                    map.insert("result".to_string(), result.clone());
                }
                ResponsePayload::Error(error) => {
                    let mut object = Map::new();
                    object.insert("code".to_string(), Value::from(error.code));
                    object.insert(
                        "message".to_string(),
                        Value::String(error.message.clone()),
                    );
                    if let Some(data) = error.data.clone() {
                        object.insert("data".to_string(), data);
                    }
                    map.insert("error".to_string(), Value::Object(object));
                }
            }
        }
    }

    Ok(Value::Object(map))
}

/// Classifies a decoded JSON value into a [`Message`].
pub fn decode(value: Value) -> Result<Message, ProtocolError> {
    let Value::Object(map) = value else {
        return Err(ProtocolError::new("malformed message"));
    };

    let id = match map.get("id") {
        None => None,
        Some(raw) => Some(parse_id(raw).ok_or_else(|| ProtocolError::new("invalid message id"))?),
    };
    let method = match map.get("method") {
        None => None,
        Some(raw) => Some(
            raw.as_str()
                .ok_or_else(|| ProtocolError::new("method must be a string"))?
                .to_string(),
        ),
    };
    let has_result = map.contains_key("result");
    let has_error = map.contains_key("error");
    let params = map.get("params").cloned();

    if let Some(id) = id {
        if has_result || has_error {
            let payload = decode_payload(&map, has_result, has_error)?;
            return Ok(Message::Response(Response { id, payload }));
        }
        if let Some(method) = method {
            return Ok(Message::Request(Request {
                id: Some(id),
                method,
                params,
            }));
        }
        return Err(ProtocolError::new("malformed message"));
    }

    if let Some(method) = method {
        return Ok(Message::Notification(Notification { method, params }));
    }

    Err(ProtocolError::new("malformed message"))
}

fn decode_payload(
    map: &Map<String, Value>,
    has_result: bool,
    has_error: bool,
) -> Result<ResponsePayload, ProtocolError> {
    match (has_result, has_error) {
        (true, false) => {
            let result = map
                .get("result")
                .cloned()
                .ok_or_else(|| ProtocolError::new("malformed message"))?;
            Ok(ResponsePayload::Result(result))
        }
        (false, true) => {
            let Some(Value::Object(error)) = map.get("error") else {
                return Err(ProtocolError::new("error must be an object"));
            };
            let code = error
                .get("code")
                .and_then(Value::as_i64)
                .ok_or_else(|| ProtocolError::new("error code must be an integer"))?;
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::new("error message must be a string"))?
                .to_string();
            let data = error.get("data").cloned();
            Ok(ResponsePayload::Error(ErrorObject {
                code,
                message,
                data,
            }))
        }
        _ => Err(ProtocolError::new(
            "response must carry exactly one of result/error",
        )),
    }
}

fn id_value(id: &Id) -> Value {
    match id {
        Id::String(value) => Value::String(value.clone()),
        Id::Integer(value) => Value::from(*value),
    }
}

fn parse_id(value: &Value) -> Option<Id> {
    match value {
        Value::String(value) => Some(Id::String(value.clone())),
        Value::Number(value) => value.as_i64().map(Id::Integer).or_else(|| {
            value
                .as_u64()
                .and_then(|v| i64::try_from(v).ok())
                .map(Id::Integer)
        }),
        _ => None,
    }
}
