//! Purpose: Blocking JSON-RPC client for a running `nekobox-core serve`.
//! Exports: `RpcClient`.
//! Role: Backend of the `call` subcommand and of HTTP integration tests.
//! Invariants: Base URLs are normalized to `scheme://host[:port]/`; requests
//! always go to `/rpc`.
//! Invariants: Protocol errors become `Error`; operation failures stay inside
//! the typed responses.
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::control::{
    ErrorResponse, ListConnectionsResponse, QueryStatsRequest, QueryStatsResponse, StartRequest,
    TestRequest, TestResponse,
};
use crate::core::error::{Error, ErrorKind};
use crate::rpc::{
    INVALID_PARAMS_CODE, INVALID_REQUEST_CODE, JsonRpcId, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_FOUND_CODE,
};

pub struct RpcClient {
    endpoint: Url,
    token: Option<String>,
    agent: ureq::Agent,
    next_id: AtomicI64,
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let base_url = normalize_base_url(base_url.into())?;
        let endpoint = base_url.join("rpc").map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid server url")
                .with_source(err)
        })?;
        Ok(Self {
            endpoint,
            token: None,
            agent: ureq::AgentBuilder::new().build(),
            next_id: AtomicI64::new(1),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Overall per-request timeout. Engine creation during `Start`/`Test` may
    /// take several seconds, so keep this generous.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::AgentBuilder::new().timeout(timeout).build();
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn ping(&self) -> Result<(), Error> {
        self.call::<Value>("ping", None).map(|_| ())
    }

    pub fn start(&self, request: &StartRequest) -> Result<ErrorResponse, Error> {
        self.call("Start", Some(encode(request)?))
    }

    pub fn stop(&self) -> Result<ErrorResponse, Error> {
        self.call("Stop", None)
    }

    pub fn test(&self, request: &TestRequest) -> Result<TestResponse, Error> {
        self.call("Test", Some(encode(request)?))
    }

    pub fn query_stats(&self, request: &QueryStatsRequest) -> Result<QueryStatsResponse, Error> {
        self.call("QueryStats", Some(encode(request)?))
    }

    pub fn list_connections(&self) -> Result<ListConnectionsResponse, Error> {
        self.call("ListConnections", None)
    }

    pub fn exit(&self) -> Result<(), Error> {
        self.call::<Value>("Exit", None).map(|_| ())
    }

    /// Sends one request and decodes its `result`.
    pub fn call<R: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<R, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(JsonRpcId::Number(id), method, params);
        let payload = serde_json::to_string(&request).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode request json")
                .with_source(err)
        })?;

        let mut http = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "application/json")
            .set("Accept", "application/json");
        if let Some(token) = &self.token {
            http = http.set("Authorization", &format!("Bearer {token}"));
        }
        let response = match http.send_string(&payload) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                return Err(status_error(code, response));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("request failed")
                    .with_hint("Is `nekobox-core serve` running at that address?")
                    .with_source(err));
            }
        };

        let envelope: JsonRpcResponse = serde_json::from_reader(response.into_reader()).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to decode response json")
                .with_source(err)
        })?;
        if let Some(error) = envelope.error {
            let kind = match error.code {
                INVALID_REQUEST_CODE | METHOD_NOT_FOUND_CODE | INVALID_PARAMS_CODE => {
                    ErrorKind::Usage
                }
                _ => ErrorKind::Internal,
            };
            return Err(Error::new(kind).with_message(format!("{method}: {}", error.message)));
        }
        let result = envelope.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("unexpected {method} result"))
                .with_source(err)
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode request params")
            .with_source(err)
    })
}

fn status_error(code: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    let message = if body.trim().is_empty() {
        format!("server returned HTTP {code}")
    } else {
        format!("server returned HTTP {code}: {}", body.trim())
    };
    let error = Error::new(ErrorKind::Io).with_message(message);
    if code == 401 {
        error.with_hint("Pass the server's --token.")
    } else {
        error
    }
}

fn normalize_base_url(raw: String) -> Result<Url, Error> {
    let raw = if raw.contains("://") {
        raw
    } else {
        format!("http://{raw}")
    };
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid server url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage).with_message("server url must use http or https"));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
