// JSON-RPC Wire Types
//
// Envelope structs shared by the HTTP surface and the stdio backend link,
// plus strict envelope parsing with the rejection rules of the metered
// surface: exact "2.0" version string, string method, and ids restricted
// to string, number or null.

pub mod backend;

use crate::error::{rpc_code, GateError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
    Null,
}

impl RpcId {
    pub fn as_value(&self) -> Value {
        match self {
            RpcId::Number(n) => Value::from(*n),
            RpcId::String(s) => Value::from(s.clone()),
            RpcId::Null => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
}

impl RpcRequest {
    pub fn new(method: &str, params: Option<Value>, id: Option<RpcId>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Tool name for `tools/call`-shaped requests.
    pub fn tool_name(&self) -> Option<&str> {
        self.params.as_ref()?.get("name")?.as_str()
    }

    /// Tool arguments for `tools/call`-shaped requests.
    pub fn tool_arguments(&self) -> Value {
        self.params
            .as_ref()
            .and_then(|p| p.get("arguments"))
            .cloned()
            .unwrap_or(Value::Object(Default::default()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<RpcId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Option<RpcId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RpcId>, code: i64, message: &str, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data,
            }),
        }
    }

    pub fn from_error(id: Option<RpcId>, error: &GateError) -> Self {
        Self::failure(id, error.json_rpc_code(), &error.to_string(), None)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Parse and strictly validate an inbound envelope.
pub fn parse_request(body: &Value) -> Result<RpcRequest> {
    let obj = body
        .as_object()
        .ok_or_else(|| GateError::InvalidRequest("expected JSON object".to_string()))?;

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == "2.0" => {}
        _ => {
            return Err(GateError::InvalidRequest(
                "jsonrpc must be the exact string \"2.0\"".to_string(),
            ))
        }
    }

    let method = match obj.get("method") {
        Some(Value::String(m)) => m.clone(),
        _ => {
            return Err(GateError::InvalidRequest(
                "method must be a string".to_string(),
            ))
        }
    };

    let id = match obj.get("id") {
        None => None,
        Some(Value::Null) => Some(RpcId::Null),
        Some(Value::String(s)) => Some(RpcId::String(s.clone())),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Some(RpcId::Number(i)),
            None => {
                return Err(GateError::InvalidRequest(
                    "id must be an integer when numeric".to_string(),
                ))
            }
        },
        Some(_) => {
            return Err(GateError::InvalidRequest(
                "id must be a string, number or null".to_string(),
            ))
        }
    };

    Ok(RpcRequest {
        jsonrpc: "2.0".to_string(),
        method,
        params: obj.get("params").cloned(),
        id,
    })
}

/// Rejection code for a malformed envelope, per the wire table.
pub fn invalid_request_code() -> i64 {
    rpc_code::INVALID_REQUEST
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_valid_request() {
        let request = parse_request(&json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": "search", "arguments": {"q": "x"}},
            "id": 7
        }))
        .unwrap();
        assert_eq!(request.method, "tools/call");
        assert_eq!(request.tool_name(), Some("search"));
        assert_eq!(request.tool_arguments()["q"], "x");
        assert_eq!(request.id, Some(RpcId::Number(7)));
    }

    #[test]
    fn test_parse_rejections() {
        for body in [
            json!([1]),
            json!({"method": "m"}),
            json!({"jsonrpc": "1.0", "method": "m"}),
            json!({"jsonrpc": "2.0"}),
            json!({"jsonrpc": "2.0", "method": 5}),
            json!({"jsonrpc": "2.0", "method": "m", "id": {"o": 1}}),
            json!({"jsonrpc": "2.0", "method": "m", "id": [1]}),
        ] {
            let err = parse_request(&body).unwrap_err();
            assert_eq!(err.json_rpc_code(), rpc_code::INVALID_REQUEST, "{:?}", body);
        }
    }

    #[test]
    fn test_id_forms_accepted() {
        for id in [json!("abc"), json!(3), json!(null)] {
            let body = json!({"jsonrpc": "2.0", "method": "m", "id": id});
            assert!(parse_request(&body).is_ok());
        }
        // Absent id is a notification.
        let request = parse_request(&json!({"jsonrpc": "2.0", "method": "m"})).unwrap();
        assert!(request.id.is_none());
    }

    #[test]
    fn test_response_serialization_round_trip() {
        let response = RpcResponse::success(Some(RpcId::String("a".to_string())), json!({"ok": true}));
        let raw = serde_json::to_string(&response).unwrap();
        assert!(!raw.contains("error"));
        let parsed: RpcResponse = serde_json::from_str(&raw).unwrap();
        assert!(parsed.is_success());

        let failure = RpcResponse::from_error(
            Some(RpcId::Number(1)),
            &GateError::InsufficientCredits("need 5".to_string()),
        );
        assert_eq!(failure.error.as_ref().unwrap().code, rpc_code::INSUFFICIENT_CREDITS);
    }
}
