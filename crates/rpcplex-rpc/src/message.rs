use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RpcError};

/// A message on the RPC channel.
///
/// Encoded as JSON, internally tagged by `kind`:
///
/// ```json
/// {"kind":"request","id":7,"proxy":"Math","method":"add","args":[2,3]}
/// {"kind":"response","id":7,"proxy":"Math","outcome":{"status":"success","value":5}}
/// {"kind":"notification","proxy":"Log","method":"info","args":["ready"]}
/// {"kind":"cancel","id":7,"proxy":"Math"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Request {
        id: u64,
        proxy: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Response {
        id: u64,
        proxy: String,
        outcome: Outcome,
    },
    Notification {
        proxy: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Cancel {
        id: u64,
        proxy: String,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The proxy name the message is addressed to.
    pub fn proxy(&self) -> &str {
        match self {
            Message::Request { proxy, .. }
            | Message::Response { proxy, .. }
            | Message::Notification { proxy, .. }
            | Message::Cancel { proxy, .. } => proxy,
        }
    }
}

/// Result of a request, carried by a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        #[serde(default)]
        value: Value,
    },
    Failure {
        error: Failure,
    },
}

impl Outcome {
    pub fn success(value: Value) -> Self {
        Outcome::Success { value }
    }

    pub fn failure(code: FailureCode, message: impl Into<String>) -> Self {
        Outcome::Failure {
            error: Failure {
                code,
                message: message.into(),
            },
        }
    }
}

/// Error payload of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub code: FailureCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    HandlerNotFound,
    MethodNotFound,
    HandlerError,
    Cancelled,
}

impl Failure {
    /// Map to the error surfaced to the caller of `proxy.method`.
    pub fn into_error(self, proxy: &str, method: &str) -> RpcError {
        match self.code {
            FailureCode::HandlerNotFound => RpcError::HandlerNotFound {
                proxy: proxy.to_string(),
            },
            FailureCode::MethodNotFound => RpcError::MethodNotFound {
                proxy: proxy.to_string(),
                method: method.to_string(),
            },
            FailureCode::HandlerError => RpcError::RemoteHandler(self.message),
            FailureCode::Cancelled => RpcError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_wire_shape() {
        let msg = Message::Request {
            id: 7,
            proxy: "Math".into(),
            method: "add".into(),
            args: vec![json!(2), json!(3)],
        };
        let wire: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({"kind": "request", "id": 7, "proxy": "Math", "method": "add", "args": [2, 3]})
        );
    }

    #[test]
    fn failure_response_wire_shape() {
        let msg = Message::Response {
            id: 1,
            proxy: "Unknown".into(),
            outcome: Outcome::failure(FailureCode::HandlerNotFound, "no handler"),
        };
        let wire: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({
                "kind": "response",
                "id": 1,
                "proxy": "Unknown",
                "outcome": {
                    "status": "failure",
                    "error": {"code": "handler_not_found", "message": "no handler"}
                }
            })
        );
    }

    #[test]
    fn decodes_without_optional_fields() {
        let msg = Message::decode(br#"{"kind":"notification","proxy":"Log","method":"flush"}"#)
            .unwrap();
        assert_eq!(
            msg,
            Message::Notification {
                proxy: "Log".into(),
                method: "flush".into(),
                args: vec![],
            }
        );

        let msg =
            Message::decode(br#"{"kind":"response","id":3,"proxy":"P","outcome":{"status":"success"}}"#)
                .unwrap();
        assert!(matches!(
            msg,
            Message::Response {
                outcome: Outcome::Success { value: Value::Null },
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(matches!(
            Message::decode(br#"{"kind":"subscribe","proxy":"P"}"#),
            Err(RpcError::Json(_))
        ));
        assert!(Message::decode(b"not json").is_err());
    }

    #[test]
    fn failure_maps_to_caller_error() {
        let failure = |code| Failure {
            code,
            message: "boom".into(),
        };

        assert!(matches!(
            failure(FailureCode::MethodNotFound).into_error("Math", "sqrt"),
            RpcError::MethodNotFound { proxy, method } if proxy == "Math" && method == "sqrt"
        ));
        assert!(matches!(
            failure(FailureCode::HandlerError).into_error("Math", "div"),
            RpcError::RemoteHandler(msg) if msg == "boom"
        ));
        assert!(matches!(
            failure(FailureCode::Cancelled).into_error("Math", "div"),
            RpcError::Cancelled
        ));
    }
}
