//! JSON-RPC envelope codec.
//!
//! Every inbound payload is classified into exactly one [`MessageEnvelope`]
//! variant before any session logic sees it. A request and a notification
//! differ only in whether the `id` key is present at all; `"id": null` is
//! rejected rather than read as a notification.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{INTERNAL_ERROR_CODE, JSONRPC_VERSION, RequestId};

pub type Params = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON")]
    NotJson,
    #[error("payload is not a JSON object")]
    NotObject,
    #[error("missing or unsupported jsonrpc version")]
    BadVersion,
    #[error("id must be a string or an integer")]
    BadId,
    #[error("method must be a non-empty string")]
    BadMethod,
    #[error("params must be an object")]
    BadParams,
    #[error("response must carry exactly one of result or error")]
    AmbiguousResponse,
    #[error("error object must carry an integer code and a string message")]
    BadError,
    #[error("payload is neither a request, a notification nor a response")]
    Unclassifiable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Params>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcNotification {
    pub method: String,
    pub params: Option<Params>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR_CODE,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: RequestId,
    pub outcome: ResponseOutcome,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Result(result),
        }
    }

    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Error(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageEnvelope {
    Request(RpcRequest),
    Notification(RpcNotification),
    Response(RpcResponse),
}

impl MessageEnvelope {
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| EnvelopeError::NotJson)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut object) = value else {
            return Err(EnvelopeError::NotObject);
        };

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(EnvelopeError::BadVersion);
        }

        let id = match object.remove("id") {
            Some(raw_id) => Some(parse_id(raw_id)?),
            None => None,
        };

        if let Some(method) = object.remove("method") {
            let method = match method {
                Value::String(method) if !method.is_empty() => method,
                _ => return Err(EnvelopeError::BadMethod),
            };
            let params = match object.remove("params") {
                None => None,
                Some(Value::Object(params)) => Some(params),
                Some(_) => return Err(EnvelopeError::BadParams),
            };
            return Ok(match id {
                Some(id) => Self::Request(RpcRequest { id, method, params }),
                None => Self::Notification(RpcNotification { method, params }),
            });
        }

        let Some(id) = id else {
            return Err(EnvelopeError::Unclassifiable);
        };

        let outcome = match (object.remove("result"), object.remove("error")) {
            (Some(result), None) => ResponseOutcome::Result(result),
            (None, Some(error)) => ResponseOutcome::Error(parse_error(error)?),
            _ => return Err(EnvelopeError::AmbiguousResponse),
        };

        Ok(Self::Response(RpcResponse { id, outcome }))
    }

    pub fn request(id: RequestId, method: &str, params: Option<Params>) -> Self {
        Self::Request(RpcRequest {
            id,
            method: method.to_string(),
            params,
        })
    }

    pub fn notification(method: &str, params: Option<Params>) -> Self {
        Self::Notification(RpcNotification {
            method: method.to_string(),
            params,
        })
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(&request.method),
            Self::Notification(notification) => Some(&notification.method),
            Self::Response(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            "jsonrpc".to_string(),
            Value::String(JSONRPC_VERSION.to_string()),
        );
        match self {
            Self::Request(request) => {
                object.insert("id".to_string(), id_value(&request.id));
                object.insert("method".to_string(), Value::String(request.method.clone()));
                if let Some(params) = &request.params {
                    object.insert("params".to_string(), Value::Object(params.clone()));
                }
            }
            Self::Notification(notification) => {
                object.insert(
                    "method".to_string(),
                    Value::String(notification.method.clone()),
                );
                if let Some(params) = &notification.params {
                    object.insert("params".to_string(), Value::Object(params.clone()));
                }
            }
            Self::Response(response) => {
                object.insert("id".to_string(), id_value(&response.id));
                match &response.outcome {
                    ResponseOutcome::Result(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    ResponseOutcome::Error(error) => {
                        let error = serde_json::to_value(error).unwrap_or_else(|_| {
                            serde_json::json!({
                                "code": error.code,
                                "message": error.message,
                            })
                        });
                        object.insert("error".to_string(), error);
                    }
                }
            }
        }
        Value::Object(object)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value())
    }
}

/// Serializes typed params into the object form the envelope carries.
pub fn params_from<T: Serialize>(params: &T) -> Result<Option<Params>, serde_json::Error> {
    match serde_json::to_value(params)? {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(None),
        other => Err(serde::ser::Error::custom(format!(
            "params must serialize to an object, got {other}"
        ))),
    }
}

/// Deserializes envelope params into a typed shape; absent params read as `{}`.
pub fn params_into<T: for<'de> Deserialize<'de>>(
    params: Option<&Params>,
) -> Result<T, serde_json::Error> {
    let value = Value::Object(params.cloned().unwrap_or_default());
    serde_json::from_value(value)
}

fn parse_id(raw: Value) -> Result<RequestId, EnvelopeError> {
    match raw {
        Value::String(id) => Ok(RequestId::String(id)),
        Value::Number(number) => number
            .as_i64()
            .map(RequestId::Integer)
            .ok_or(EnvelopeError::BadId),
        _ => Err(EnvelopeError::BadId),
    }
}

fn parse_error(raw: Value) -> Result<RpcError, EnvelopeError> {
    let code = raw
        .get("code")
        .and_then(Value::as_i64)
        .ok_or(EnvelopeError::BadError)?;
    let message = raw
        .get("message")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::BadError)?
        .to_string();
    Ok(RpcError {
        code,
        message,
        data: raw.get("data").cloned(),
    })
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::String(id) => Value::String(id.clone()),
        RequestId::Integer(id) => Value::from(*id),
    }
}
