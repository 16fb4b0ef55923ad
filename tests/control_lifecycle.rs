//! Purpose: Exercise the control surface end to end against fake engines.
//! Role: Covers the Start/Stop state machine, stats attachment, probing and
//! normalization through `ControlService`, and transient Test instances.
//! Invariants: No network or external engine binary is required.
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, RwLock};
use std::time::Duration;

use nekobox_core::control::{
    ControlService, LoadConfig, QueryStatsRequest, StartRequest, TestMode, TestRequest,
    TestResponse,
};
use nekobox_core::core::cancel::CancelToken;
use nekobox_core::core::error::{Error, ErrorKind};
use nekobox_core::core::probe::{Field, Introspect, Method, RawPayload, Returned};
use nekobox_core::engine::process::{ProcessEngineConfig, ProcessEngineFactory};
use nekobox_core::engine::{
    Engine, EngineFactory, Spawned, StatsOptions, StatsService, TrafficCounters,
};
use nekobox_core::fulltest::FullTestRunner;
use nekobox_core::speedtest::LatencyProbe;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Listing {
    /// No accessor at all.
    Absent,
    /// `ListConnections` panics; `Connections` returns a wrapped object.
    PanicThenObject,
    /// `ListConnections` returns an error; `GetConnections` returns bytes.
    ErrorThenBytes,
    /// `ListConnections` returns text that is not JSON.
    Garbage,
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    closed: AtomicUsize,
}

struct FakeFactory {
    counters: Arc<Counters>,
    listing: Listing,
    creation_delay: Duration,
}

impl FakeFactory {
    fn new(listing: Listing) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            listing,
            creation_delay: Duration::ZERO,
        }
    }
}

impl EngineFactory for FakeFactory {
    fn create(&self, config: &[u8], cancel: &CancelToken) -> Result<Spawned, Error> {
        if !self.creation_delay.is_zero() && !cancel.sleep(self.creation_delay) {
            return Err(Error::new(ErrorKind::Cancelled).with_message("engine startup cancelled"));
        }
        if config == b"broken" {
            return Err(Error::new(ErrorKind::EngineCreation)
                .with_message("decode config: expected value at line 1 column 1"));
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Spawned {
            engine: Arc::new(FakeEngine {
                counters: Arc::clone(&self.counters),
                listing: self.listing,
                stats: RwLock::new(None),
            }),
            teardown: CancelToken::new(),
        })
    }
}

struct FakeEngine {
    counters: Arc<Counters>,
    listing: Listing,
    stats: RwLock<Option<Arc<dyn StatsService>>>,
}

impl Engine for FakeEngine {
    fn new_stats_options(&self, outbounds: Vec<String>) -> Box<dyn StatsOptions> {
        Box::new(FakeOptions {
            outbounds,
            enable_nekoray_connections: false,
        })
    }

    fn install_stats(&self, options: Box<dyn StatsOptions>) -> Result<(), Error> {
        let options = options
            .into_any()
            .downcast::<FakeOptions>()
            .map_err(|_| Error::new(ErrorKind::Engine).with_message("foreign options"))?;
        if options.outbounds.iter().any(|tag| tag == "reject-me") {
            return Err(Error::new(ErrorKind::Engine).with_message("unknown outbound reject-me"));
        }
        let counters = options
            .outbounds
            .iter()
            .map(|tag| (format!("outbound>>>{tag}>>>traffic>>>uplink"), 42))
            .collect();
        *self.stats.write().expect("stats") = Some(Arc::new(FakeStats {
            tracking: options.enable_nekoray_connections,
            listing: self.listing,
            counters,
        }));
        Ok(())
    }

    fn stats(&self) -> Option<Arc<dyn StatsService>> {
        self.stats.read().expect("stats").clone()
    }

    fn proxy_url(&self) -> Option<String> {
        Some("http://127.0.0.1:1".to_string())
    }

    fn close(&self) -> Result<(), Error> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeOptions {
    outbounds: Vec<String>,
    enable_nekoray_connections: bool,
}

impl Introspect for FakeOptions {
    fn field_mut(&mut self, name: &str) -> Option<Field<'_>> {
        match name {
            "EnableNekorayConnections" => Some(Field::Bool(&mut self.enable_nekoray_connections)),
            _ => None,
        }
    }
}

impl StatsOptions for FakeOptions {
    fn outbounds(&self) -> &[String] {
        &self.outbounds
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

struct FakeStats {
    tracking: bool,
    listing: Listing,
    counters: HashMap<String, i64>,
}

impl Introspect for FakeStats {
    fn method(&self, name: &str) -> Option<Method<'_>> {
        if !self.tracking {
            return None;
        }
        match (self.listing, name) {
            (Listing::PanicThenObject, "ListConnections") => {
                Some(Method::accessor(|| -> Returned {
                    panic!("connection table not initialized")
                }))
            }
            (Listing::PanicThenObject, "Connections") => Some(Method::accessor(|| {
                Returned::Value(RawPayload::Text(
                    r#"{"connections":[{"id":"a","upload":10}]}"#.to_string(),
                ))
            })),
            (Listing::ErrorThenBytes, "ListConnections") => Some(Method::accessor(|| {
                Returned::Fallible(Err("tracker disabled".to_string()))
            })),
            (Listing::ErrorThenBytes, "GetConnections") => Some(Method::accessor(|| {
                Returned::Value(RawPayload::Bytes(br#"[ {"id": "b"} ]"#.to_vec()))
            })),
            (Listing::Garbage, "ListConnections") => Some(Method::accessor(|| {
                Returned::Value(RawPayload::Text("not json".to_string()))
            })),
            _ => None,
        }
    }
}

impl TrafficCounters for FakeStats {
    fn query(&self, key: &str) -> i64 {
        self.counters.get(key).copied().unwrap_or(0)
    }
}

impl StatsService for FakeStats {
    fn traffic(&self) -> Option<&dyn TrafficCounters> {
        Some(self)
    }
}

struct FixedLatency {
    result: Result<u32, &'static str>,
}

impl LatencyProbe for FixedLatency {
    fn url_test(&self, engine: &dyn Engine, _url: &str, _timeout: Duration) -> Result<u32, Error> {
        assert!(engine.proxy_url().is_some());
        self.result
            .map_err(|message| Error::new(ErrorKind::TestFailed).with_message(message))
    }

    fn tcp_ping(&self, _address: &str, _timeout: Duration) -> Result<u32, Error> {
        self.result
            .map_err(|message| Error::new(ErrorKind::TestFailed).with_message(message))
    }
}

struct ReportingFullTest;

impl FullTestRunner for ReportingFullTest {
    fn run(
        &self,
        _cancel: &CancelToken,
        request: &TestRequest,
        _engine: &dyn Engine,
    ) -> Result<TestResponse, Error> {
        Ok(TestResponse {
            ms: 9,
            error: None,
            full_report: Some(format!("Latency: 9ms / In: {}", request.in_address)),
        })
    }
}

fn service(factory: FakeFactory) -> (ControlService, Arc<Counters>) {
    let counters = Arc::clone(&factory.counters);
    let service = ControlService::new(Arc::new(factory))
        .with_latency(Arc::new(FixedLatency { result: Ok(5) }))
        .with_full_test(Arc::new(ReportingFullTest));
    (service, counters)
}

fn start_request(outbounds: Option<&[&str]>, connections: bool) -> StartRequest {
    StartRequest {
        core_config: "{}".to_string(),
        stats_outbounds: outbounds.map(|tags| tags.iter().map(|tag| tag.to_string()).collect()),
        enable_nekoray_connections: connections,
    }
}

fn stats_request(tag: &str, direct: &str) -> QueryStatsRequest {
    QueryStatsRequest {
        tag: tag.to_string(),
        direct: direct.to_string(),
    }
}

#[test]
fn concurrent_starts_yield_exactly_one_running() {
    let mut factory = FakeFactory::new(Listing::Absent);
    factory.creation_delay = Duration::from_millis(100);
    let (service, counters) = service(factory);
    let service = Arc::new(service);
    let barrier = Arc::new(Barrier::new(2));

    let handles = (0..2)
        .map(|_| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                service.start(&start_request(None, false))
            })
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect::<Vec<_>>();

    let successes = results.iter().filter(|result| result.error.is_none()).count();
    assert_eq!(successes, 1);
    let rejected = results
        .iter()
        .filter_map(|result| result.error.as_deref())
        .collect::<Vec<_>>();
    assert_eq!(rejected, vec!["instance already started"]);
    assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
    assert!(service.is_running());
}

#[test]
fn failed_start_leaves_absent_and_next_start_is_accepted() {
    let (service, _) = service(FakeFactory::new(Listing::Absent));
    let failed = service.start(&StartRequest {
        core_config: "broken".to_string(),
        ..StartRequest::default()
    });
    assert_eq!(
        failed.error.as_deref(),
        Some("decode config: expected value at line 1 column 1")
    );
    assert!(!service.is_running());

    let ok = service.start(&start_request(None, false));
    assert_eq!(ok.error, None);
    assert!(service.is_running());
}

#[test]
fn malformed_config_error_reaches_caller_verbatim() {
    let temp = tempfile::tempdir().expect("tempdir");
    let service = ControlService::new(Arc::new(ProcessEngineFactory::new(ProcessEngineConfig {
        program: temp.path().join("no-such-engine"),
        work_dir: temp.path().to_path_buf(),
        startup_grace: Duration::from_millis(10),
    })));
    let response = service.start(&StartRequest {
        core_config: "{not json".to_string(),
        ..StartRequest::default()
    });
    assert_eq!(
        response.error.as_deref(),
        Some("decode config: key must be a string at line 1 column 2")
    );
    assert!(!service.is_running());
}

#[test]
fn rejected_stats_tear_the_new_instance_down() {
    let (service, counters) = service(FakeFactory::new(Listing::Absent));
    let response = service.start(&start_request(Some(&["reject-me"]), false));
    assert_eq!(response.error.as_deref(), Some("unknown outbound reject-me"));
    assert!(!service.is_running());
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_is_idempotent_and_tears_down_once() {
    let (service, counters) = service(FakeFactory::new(Listing::Absent));
    assert_eq!(service.stop().error, None);

    assert_eq!(service.start(&start_request(None, false)).error, None);
    assert_eq!(service.stop().error, None);
    assert_eq!(service.stop().error, None);
    assert!(!service.is_running());
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn query_stats_reads_counters_and_defaults_to_zero() {
    let (service, _) = service(FakeFactory::new(Listing::Absent));
    assert_eq!(service.query_stats(&stats_request("proxy", "uplink")).traffic, 0);

    service.start(&start_request(Some(&["proxy"]), false));
    assert_eq!(service.query_stats(&stats_request("proxy", "uplink")).traffic, 42);
    assert_eq!(service.query_stats(&stats_request("proxy", "downlink")).traffic, 0);
    assert_eq!(service.query_stats(&stats_request("missing", "uplink")).traffic, 0);
}

#[test]
fn query_stats_without_stats_subsystem_is_zero() {
    let (service, _) = service(FakeFactory::new(Listing::Absent));
    service.start(&start_request(None, false));
    assert_eq!(service.query_stats(&stats_request("proxy", "uplink")).traffic, 0);
}

#[test]
fn list_connections_defaults_when_absent() {
    let (service, _) = service(FakeFactory::new(Listing::PanicThenObject));
    assert_eq!(service.list_connections().nekoray_connections_json, "[]");

    service.start(&start_request(None, false));
    assert_eq!(service.list_connections().nekoray_connections_json, "[]");
}

#[test]
fn list_connections_needs_tracking_flag() {
    let (service, _) = service(FakeFactory::new(Listing::PanicThenObject));
    service.start(&start_request(Some(&["proxy"]), false));
    assert_eq!(service.list_connections().nekoray_connections_json, "[]");
}

#[test]
fn list_connections_survives_panicking_accessor() {
    let (service, _) = service(FakeFactory::new(Listing::PanicThenObject));
    service.start(&start_request(Some(&["proxy"]), true));
    assert_eq!(
        service.list_connections().nekoray_connections_json,
        r#"[{"id":"a","upload":10}]"#
    );
}

#[test]
fn list_connections_skips_erroring_accessor() {
    let (service, _) = service(FakeFactory::new(Listing::ErrorThenBytes));
    service.start(&start_request(Some(&["proxy"]), true));
    assert_eq!(
        service.list_connections().nekoray_connections_json,
        r#"[{"id":"b"}]"#
    );
}

#[test]
fn list_connections_garbage_becomes_empty_array() {
    let (service, _) = service(FakeFactory::new(Listing::Garbage));
    service.start(&start_request(Some(&["proxy"]), true));
    assert_eq!(service.list_connections().nekoray_connections_json, "[]");
}

#[test]
fn url_test_without_instance_reports_zero() {
    let (service, counters) = service(FakeFactory::new(Listing::Absent));
    let response = service.test(&TestRequest {
        mode: TestMode::UrlTest,
        url: "http://cp.cloudflare.com/".to_string(),
        ..TestRequest::default()
    });
    assert_eq!(response, TestResponse::default());
    assert_eq!(counters.created.load(Ordering::SeqCst), 0);
}

#[test]
fn url_test_against_running_instance_keeps_it() {
    let (service, counters) = service(FakeFactory::new(Listing::Absent));
    service.start(&start_request(None, false));
    let response = service.test(&TestRequest {
        mode: TestMode::UrlTest,
        url: "http://cp.cloudflare.com/".to_string(),
        ..TestRequest::default()
    });
    assert_eq!(response.ms, 5);
    assert!(service.is_running());
    assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
}

#[test]
fn transient_test_instances_are_torn_down_on_success_and_error() {
    let factory = FakeFactory::new(Listing::Absent);
    let counters = Arc::clone(&factory.counters);
    let failing = ControlService::new(Arc::new(factory))
        .with_latency(Arc::new(FixedLatency {
            result: Err("context deadline exceeded"),
        }));
    let request = TestRequest {
        mode: TestMode::UrlTest,
        config: Some(LoadConfig {
            core_config: "{}".to_string(),
        }),
        url: "http://cp.cloudflare.com/".to_string(),
        timeout: 3000,
        ..TestRequest::default()
    };

    let response = failing.test(&request);
    assert_eq!(response.ms, 0);
    assert_eq!(response.error.as_deref(), Some("context deadline exceeded"));
    assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

    let (service, counters) = service(FakeFactory::new(Listing::Absent));
    let response = service.test(&request);
    assert_eq!(response.ms, 5);
    assert_eq!(response.error, None);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert!(!service.is_running());
}

#[test]
fn transient_creation_failure_is_reported() {
    let (service, counters) = service(FakeFactory::new(Listing::Absent));
    let response = service.test(&TestRequest {
        mode: TestMode::UrlTest,
        config: Some(LoadConfig {
            core_config: "broken".to_string(),
        }),
        ..TestRequest::default()
    });
    assert_eq!(
        response.error.as_deref(),
        Some("decode config: expected value at line 1 column 1")
    );
    assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
}

#[test]
fn tcp_ping_is_independent_of_instances() {
    let (service, counters) = service(FakeFactory::new(Listing::Absent));
    let response = service.test(&TestRequest {
        mode: TestMode::TcpPing,
        address: "1.1.1.1:443".to_string(),
        ..TestRequest::default()
    });
    assert_eq!(response.ms, 5);
    assert_eq!(counters.created.load(Ordering::SeqCst), 0);
}

#[test]
fn full_test_requires_config_and_uses_transient_instance() {
    let (service, counters) = service(FakeFactory::new(Listing::Absent));
    let missing = service.test(&TestRequest {
        mode: TestMode::FullTest,
        ..TestRequest::default()
    });
    assert_eq!(missing.error.as_deref(), Some("full test requires a config"));

    let response = service.test(&TestRequest {
        mode: TestMode::FullTest,
        config: Some(LoadConfig {
            core_config: "{}".to_string(),
        }),
        in_address: "203.0.113.5".to_string(),
        full_latency: true,
        ..TestRequest::default()
    });
    assert_eq!(
        response.full_report.as_deref(),
        Some("Latency: 9ms / In: 203.0.113.5")
    );
    assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn exit_releases_instance_and_fires_hook_once() {
    let (service, counters) = service(FakeFactory::new(Listing::Absent));
    let fired = Arc::new(AtomicBool::new(false));
    {
        let fired = Arc::clone(&fired);
        service.on_exit(move || fired.store(true, Ordering::SeqCst));
    }
    service.start(&start_request(None, false));

    service.exit();
    assert!(fired.load(Ordering::SeqCst));
    assert!(!service.is_running());
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

    let after = service.start(&start_request(None, false));
    assert_eq!(after.error.as_deref(), Some("engine creation cancelled"));
    service.exit();
}

#[test]
fn exit_cancels_inflight_start() {
    let mut factory = FakeFactory::new(Listing::Absent);
    factory.creation_delay = Duration::from_secs(30);
    let (service, counters) = service(factory);
    let service = Arc::new(service);
    let started = Arc::new(Mutex::new(None));

    let starter = {
        let service = Arc::clone(&service);
        let started = Arc::clone(&started);
        std::thread::spawn(move || {
            let response = service.start(&start_request(None, false));
            *started.lock().expect("started") = Some(response);
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    service.exit();
    starter.join().expect("join");

    let response = started.lock().expect("started").take().expect("response");
    assert_eq!(response.error.as_deref(), Some("engine startup cancelled"));
    assert_eq!(counters.created.load(Ordering::SeqCst), 0);
    assert!(!service.is_running());
}
