//! Purpose: Transport-agnostic JSON-RPC 2.0 core for the control surface.
//! Exports: `RpcDispatcher`, `ControlHandler`, envelopes, `parse_jsonrpc_line`.
//! Role: Shared protocol adapter used by the stdio and HTTP transports.
//! Invariants: JSON-RPC envelopes stay stable and method routing is deterministic.
//! Invariants: Unknown methods and malformed request shapes map to protocol errors.
//! Invariants: Operation failures are successful results carrying `error`.
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::control::{
    ControlService, ErrorResponse, ListConnectionsResponse, QueryStatsRequest, QueryStatsResponse,
    StartRequest, TestRequest, TestResponse,
};

pub const JSON_RPC_VERSION: &str = "2.0";
pub const PARSE_ERROR_CODE: i32 = -32700;
pub const INVALID_REQUEST_CODE: i32 = -32600;
pub const METHOD_NOT_FOUND_CODE: i32 = -32601;
pub const INVALID_PARAMS_CODE: i32 = -32602;
pub const INTERNAL_ERROR_CODE: i32 = -32603;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    String(String),
    Number(i64),
    Null,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn success(id: JsonRpcId, result: Value) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: JsonRpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR_CODE, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST_CODE, message)
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(METHOD_NOT_FOUND_CODE, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS_CODE, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR_CODE, message)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    Response(JsonRpcResponse),
    NoResponse,
}

/// Operations reachable over RPC. Handlers are shared across concurrent
/// requests, so every method takes `&self`.
pub trait ControlHandler {
    fn start(&self, request: StartRequest) -> ErrorResponse;
    fn stop(&self) -> ErrorResponse;
    fn test(&self, request: TestRequest) -> TestResponse;
    fn query_stats(&self, request: QueryStatsRequest) -> QueryStatsResponse;
    fn list_connections(&self) -> ListConnectionsResponse;
    fn exit(&self);
}

impl ControlHandler for ControlService {
    fn start(&self, request: StartRequest) -> ErrorResponse {
        ControlService::start(self, &request)
    }

    fn stop(&self) -> ErrorResponse {
        ControlService::stop(self)
    }

    fn test(&self, request: TestRequest) -> TestResponse {
        ControlService::test(self, &request)
    }

    fn query_stats(&self, request: QueryStatsRequest) -> QueryStatsResponse {
        ControlService::query_stats(self, &request)
    }

    fn list_connections(&self) -> ListConnectionsResponse {
        ControlService::list_connections(self)
    }

    fn exit(&self) {
        ControlService::exit(self)
    }
}

impl<H: ControlHandler + ?Sized> ControlHandler for Arc<H> {
    fn start(&self, request: StartRequest) -> ErrorResponse {
        (**self).start(request)
    }

    fn stop(&self) -> ErrorResponse {
        (**self).stop()
    }

    fn test(&self, request: TestRequest) -> TestResponse {
        (**self).test(request)
    }

    fn query_stats(&self, request: QueryStatsRequest) -> QueryStatsResponse {
        (**self).query_stats(request)
    }

    fn list_connections(&self) -> ListConnectionsResponse {
        (**self).list_connections()
    }

    fn exit(&self) {
        (**self).exit()
    }
}

pub struct RpcDispatcher<H> {
    handler: H,
}

impl<H: ControlHandler> RpcDispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn dispatch_value(&self, value: Value) -> DispatchOutcome {
        match parse_jsonrpc_request(value) {
            Ok(request) => self.dispatch_request(request),
            Err(response) => DispatchOutcome::Response(response),
        }
    }

    pub fn dispatch_request(&self, request: JsonRpcRequest) -> DispatchOutcome {
        let id = request.id.clone();
        let route_result = self.route_method(request);
        match id {
            Some(response_id) => match route_result {
                Ok(result) => {
                    DispatchOutcome::Response(JsonRpcResponse::success(response_id, result))
                }
                Err(error) => DispatchOutcome::Response(JsonRpcResponse::error(response_id, error)),
            },
            None => DispatchOutcome::NoResponse,
        }
    }

    fn route_method(&self, request: JsonRpcRequest) -> Result<Value, JsonRpcError> {
        match request.method.as_str() {
            "ping" => {
                ensure_object_or_absent(request.params.as_ref())?;
                Ok(json!({}))
            }
            "Start" => {
                let params = parse_params::<StartRequest>(request.params, "Start")?;
                to_value(self.handler.start(params))
            }
            "Stop" => {
                ensure_object_or_absent(request.params.as_ref())?;
                to_value(self.handler.stop())
            }
            "Test" => {
                let params = parse_params::<TestRequest>(request.params, "Test")?;
                to_value(self.handler.test(params))
            }
            "QueryStats" => {
                let params = parse_params::<QueryStatsRequest>(request.params, "QueryStats")?;
                to_value(self.handler.query_stats(params))
            }
            "ListConnections" => {
                ensure_object_or_absent(request.params.as_ref())?;
                to_value(self.handler.list_connections())
            }
            "Exit" => {
                ensure_object_or_absent(request.params.as_ref())?;
                self.handler.exit();
                Ok(json!({}))
            }
            _ => Err(JsonRpcError::method_not_found(format!(
                "method not found: {}",
                request.method
            ))),
        }
    }
}

pub fn parse_jsonrpc_line(line: &str) -> Result<Value, JsonRpcError> {
    serde_json::from_str::<Value>(line).map_err(|_| JsonRpcError::parse_error("invalid JSON"))
}

fn parse_jsonrpc_request(value: Value) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let mut object = match value {
        Value::Object(object) => object,
        _ => {
            return Err(JsonRpcResponse::error(
                JsonRpcId::Null,
                JsonRpcError::invalid_request("request must be a JSON object"),
            ));
        }
    };

    let mut id: Option<JsonRpcId> = None;
    if let Some(raw_id) = object.remove("id") {
        let parsed_id = parse_jsonrpc_id(raw_id)
            .map_err(|error| JsonRpcResponse::error(JsonRpcId::Null, error))?;
        id = Some(parsed_id);
    }
    let error_id = id.clone().unwrap_or(JsonRpcId::Null);

    let jsonrpc = object
        .remove("jsonrpc")
        .and_then(|value| value.as_str().map(ToString::to_string))
        .ok_or_else(|| {
            JsonRpcResponse::error(
                error_id.clone(),
                JsonRpcError::invalid_request("missing jsonrpc field"),
            )
        })?;
    if jsonrpc != JSON_RPC_VERSION {
        return Err(JsonRpcResponse::error(
            error_id,
            JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
        ));
    }

    let method = object
        .remove("method")
        .and_then(|value| value.as_str().map(ToString::to_string))
        .ok_or_else(|| {
            JsonRpcResponse::error(
                error_id.clone(),
                JsonRpcError::invalid_request("missing method field"),
            )
        })?;

    let params = object.remove("params");
    Ok(JsonRpcRequest {
        jsonrpc,
        id,
        method,
        params,
    })
}

fn parse_jsonrpc_id(value: Value) -> Result<JsonRpcId, JsonRpcError> {
    match value {
        Value::String(value) => Ok(JsonRpcId::String(value)),
        Value::Number(value) => value
            .as_i64()
            .map(JsonRpcId::Number)
            .ok_or_else(|| JsonRpcError::invalid_request("id must be an integer number")),
        Value::Null => Ok(JsonRpcId::Null),
        _ => Err(JsonRpcError::invalid_request(
            "id must be a string, integer number, or null",
        )),
    }
}

fn parse_params<T: DeserializeOwned>(
    params: Option<Value>,
    method: &'static str,
) -> Result<T, JsonRpcError> {
    match params {
        Some(params @ Value::Object(_)) => serde_json::from_value(params)
            .map_err(|err| JsonRpcError::invalid_params(format!("{method}: {err}"))),
        _ => Err(JsonRpcError::invalid_params(format!(
            "{method} requires object params"
        ))),
    }
}

fn ensure_object_or_absent(params: Option<&Value>) -> Result<(), JsonRpcError> {
    match params {
        None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
        _ => Err(JsonRpcError::invalid_params(
            "params must be an object when provided",
        )),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|_| JsonRpcError::internal_error("failed to encode result"))
}
