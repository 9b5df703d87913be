//! JSON-RPC 2.0 envelope used between the CLI and the daemon.
//!
//! One request or response per line. Store failures carry codes in the
//! server-reserved range so clients can tell a missing job from a busy store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::StoreError;

const VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

pub const NOT_FOUND: i32 = -32001;
pub const ALREADY_EXISTS: i32 = -32002;
pub const CONFLICT: i32 = -32003;
pub const UNAVAILABLE: i32 = -32004;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    pub fn call(method: &str, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != VERSION {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }
}

impl From<&StoreError> for RpcError {
    fn from(error: &StoreError) -> Self {
        let code = match error {
            StoreError::NotFound { .. } => NOT_FOUND,
            StoreError::AlreadyExists { .. } => ALREADY_EXISTS,
            StoreError::Conflict { .. } => CONFLICT,
            StoreError::UnknownKind(_) | StoreError::Invalid(_) => INVALID_PARAMS,
            StoreError::Unavailable(_) => UNAVAILABLE,
        };
        Self::new(code, error.to_string())
    }
}

/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl Response {
    pub fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                jsonrpc: VERSION.to_string(),
                result: Some(result),
                error: None,
                id,
            },
            Err(e) => Self::internal_error(id, format!("unserializable result: {e}")),
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self::failure(id, RpcError::new(code, message))
    }

    pub fn error_with_data(
        id: Value,
        code: i32,
        message: impl Into<String>,
        data: impl Serialize,
    ) -> Self {
        Self::failure(id, RpcError::new(code, message).with_data(data))
    }

    pub fn store_error(id: Value, error: &StoreError) -> Self {
        Self::failure(id, error.into())
    }

    /// The request id is unknown when the line did not parse.
    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, details)
    }

    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_round_trips_through_client_constructor() {
        let line = serde_json::to_string(&Request::call("jobs.list", Some(json!({"kind": "backup"})), 7))
            .unwrap();
        let req: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(req.method, "jobs.list");
        assert_eq!(req.id, Some(json!(7)));
        assert!(req.validate().is_ok());
        assert!(!req.is_notification());
    }

    #[test]
    fn test_wrong_version_is_invalid() {
        let req: Request = serde_json::from_str(r#"{"jsonrpc":"1.0","method":"daemon.status","id":1}"#).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_store_errors_map_to_codes() {
        let resp = Response::store_error(Value::Null, &StoreError::not_found("VolumeSnapshotBackup", "b1"));
        let error = resp.error.unwrap();
        assert_eq!(error.code, NOT_FOUND);
        assert!(error.message.contains("b1"));

        let error = RpcError::from(&StoreError::UnknownKind("Deployment".into()));
        assert_eq!(error.code, INVALID_PARAMS);
        let error = RpcError::from(&StoreError::Unavailable("locked".into()));
        assert_eq!(error.code, UNAVAILABLE);
    }

    #[test]
    fn test_error_data_is_carried() {
        let resp = Response::error_with_data(json!(3), INVALID_PARAMS, "not finished", json!({"phase": "InProgress"}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["data"]["phase"], "InProgress");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_success_omits_error() {
        let json = serde_json::to_string(&Response::success(json!(1), "ok")).unwrap();
        assert!(json.contains(r#""result":"ok""#));
        assert!(!json.contains("error"));
    }
}
