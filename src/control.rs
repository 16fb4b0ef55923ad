//! Purpose: The control surface: Start/Stop/Test/QueryStats/ListConnections/Exit.
//! Exports: `ControlService`, request/response types, `stats_key`.
//! Role: Composes the registry, the capability prober and the normalizer
//! behind the RPC methods.
//! Invariants: Operation failures are returned as `error` strings, never as
//! protocol errors; QueryStats and ListConnections never fail.
//! Invariants: Stats are attached before an instance becomes visible.
//! Notes: Every call derives its cancellation from the service root token,
//! which `exit` cancels.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::cancel::CancelToken;
use crate::core::error::{Error, ErrorKind};
use crate::core::normalize::{EMPTY_ARRAY, normalize};
use crate::core::probe::{CONNECTION_LISTING, CONNECTION_TRACKING, call_accessor, set_flag};
use crate::core::registry::InstanceRegistry;
use crate::engine::{Engine, EngineFactory};
use crate::fulltest::{BasicFullTest, FullTestRunner};
use crate::speedtest::{LatencyProbe, NetLatency};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub core_config: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_outbounds: Option<Vec<String>>,
    #[serde(default)]
    pub enable_nekoray_connections: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ErrorResponse {
    fn from_result(result: Result<(), Error>) -> Self {
        Self {
            error: result.err().map(|err| err.wire_message()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMode {
    #[default]
    UrlTest,
    TcpPing,
    FullTest,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    pub core_config: String,
}

/// Parameters of `Test`. `timeout` is in milliseconds and
/// `full_speed_timeout` in seconds; zero selects the defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRequest {
    pub mode: TestMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<LoadConfig>,
    pub url: String,
    pub address: String,
    pub timeout: u32,
    pub in_address: String,
    pub full_latency: bool,
    pub full_udp_latency: bool,
    pub full_speed: bool,
    pub full_in_out: bool,
    pub full_speed_url: String,
    pub full_speed_timeout: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResponse {
    pub ms: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_report: Option<String>,
}

impl TestResponse {
    fn elapsed(ms: u32) -> Self {
        Self {
            ms,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatsRequest {
    pub tag: String,
    pub direct: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatsResponse {
    pub traffic: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListConnectionsResponse {
    pub nekoray_connections_json: String,
}

/// Counter name for one outbound's traffic in one direction.
pub fn stats_key(tag: &str, direction: &str) -> String {
    format!("outbound>>>{tag}>>>traffic>>>{direction}")
}

type ExitHook = Box<dyn FnOnce() + Send>;

pub struct ControlService {
    registry: InstanceRegistry,
    latency: Arc<dyn LatencyProbe>,
    full_test: Arc<dyn FullTestRunner>,
    root: CancelToken,
    exit_hook: Mutex<Option<ExitHook>>,
    debug: bool,
}

impl ControlService {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        let latency: Arc<dyn LatencyProbe> = Arc::new(NetLatency);
        Self {
            registry: InstanceRegistry::new(factory),
            full_test: Arc::new(BasicFullTest::new(Arc::clone(&latency))),
            latency,
            root: CancelToken::new(),
            exit_hook: Mutex::new(None),
            debug: false,
        }
    }

    pub fn with_latency(mut self, latency: Arc<dyn LatencyProbe>) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_full_test(mut self, full_test: Arc<dyn FullTestRunner>) -> Self {
        self.full_test = full_test;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Registers the transport callback fired once by `exit`.
    pub fn on_exit(&self, hook: impl FnOnce() + Send + 'static) {
        *self
            .exit_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    pub fn is_running(&self) -> bool {
        self.registry.current().is_some()
    }

    pub fn start(&self, request: &StartRequest) -> ErrorResponse {
        if self.debug {
            info!(config = %request.core_config, "Start");
        }
        let cancel = self.root.child();
        let result = self
            .registry
            .acquire(request.core_config.as_bytes(), &cancel, |instance| {
                match &request.stats_outbounds {
                    Some(outbounds) => attach_stats(
                        instance.engine(),
                        outbounds.clone(),
                        request.enable_nekoray_connections,
                    ),
                    None => Ok(()),
                }
            })
            .map(|_| ());
        if let Err(err) = &result {
            warn!(error = %err, "start failed");
        }
        ErrorResponse::from_result(result)
    }

    pub fn stop(&self) -> ErrorResponse {
        let result = self.registry.release();
        if let Err(err) = &result {
            warn!(error = %err, "stop reported a teardown error");
        }
        ErrorResponse::from_result(result)
    }

    pub fn test(&self, request: &TestRequest) -> TestResponse {
        let cancel = self.root.child();
        let timeout = Duration::from_millis(u64::from(request.timeout));
        let outcome = match request.mode {
            TestMode::UrlTest => self.url_test(request, &cancel, timeout),
            TestMode::TcpPing => self
                .latency
                .tcp_ping(&request.address, timeout)
                .map(TestResponse::elapsed),
            TestMode::FullTest => self.full_test(request, &cancel),
        };
        match outcome {
            Ok(response) => response,
            Err(err) => {
                debug!(mode = ?request.mode, error = %err, "test failed");
                TestResponse {
                    error: Some(err.wire_message()),
                    ..TestResponse::default()
                }
            }
        }
    }

    pub fn query_stats(&self, request: &QueryStatsRequest) -> QueryStatsResponse {
        let key = stats_key(&request.tag, &request.direct);
        let traffic = self
            .registry
            .current()
            .and_then(|instance| instance.engine().stats())
            .and_then(|stats| stats.traffic().map(|counters| counters.query(&key)))
            .unwrap_or(0);
        QueryStatsResponse { traffic }
    }

    pub fn list_connections(&self) -> ListConnectionsResponse {
        let listing = self
            .registry
            .current()
            .and_then(|instance| instance.engine().stats())
            .and_then(|stats| {
                call_accessor(&CONNECTION_LISTING, stats.as_ref(), |raw| {
                    normalize(raw)
                        .map_err(|err| debug!(error = %err, "connection listing not usable"))
                        .ok()
                })
                .ok()
            });
        ListConnectionsResponse {
            nekoray_connections_json: listing.unwrap_or_else(|| EMPTY_ARRAY.to_string()),
        }
    }

    /// Releases the instance, aborts in-flight engine creation and fires the
    /// exit hook.
    pub fn exit(&self) {
        self.root.cancel();
        if let Err(err) = self.registry.release() {
            warn!(error = %err, "release during exit failed");
        }
        let hook = self
            .exit_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn url_test(
        &self,
        request: &TestRequest,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Result<TestResponse, Error> {
        match &request.config {
            Some(config) => {
                let transient = self.registry.spawn(config.core_config.as_bytes(), cancel)?;
                self.latency
                    .url_test(transient.engine(), &request.url, timeout)
                    .map(TestResponse::elapsed)
            }
            None => match self.registry.current() {
                Some(instance) => self
                    .latency
                    .url_test(instance.engine(), &request.url, timeout)
                    .map(TestResponse::elapsed),
                None => Ok(TestResponse::default()),
            },
        }
    }

    fn full_test(&self, request: &TestRequest, cancel: &CancelToken) -> Result<TestResponse, Error> {
        let config = request.config.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("full test requires a config")
        })?;
        let transient = self.registry.spawn(config.core_config.as_bytes(), cancel)?;
        self.full_test.run(cancel, request, transient.engine())
    }
}

fn attach_stats(engine: &dyn Engine, outbounds: Vec<String>, track_connections: bool) -> Result<(), Error> {
    let mut options = engine.new_stats_options(outbounds);
    match set_flag(&CONNECTION_TRACKING, options.as_mut(), track_connections) {
        Ok(field) => debug!(field, track_connections, "connection tracking configured"),
        Err(unavailable) => debug!(%unavailable, "engine stats options lack a tracking flag"),
    }
    engine.install_stats(options)
}
