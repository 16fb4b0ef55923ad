//! Purpose: Multi-part connectivity report for a single engine configuration.
//! Exports: `FullTestRunner`, `BasicFullTest`.
//! Role: Backend of `Test` in `FullTest` mode.
//! Invariants: Individual sections never fail the whole run; their errors are
//! written into the report. Only cancellation aborts the run.
use std::io::Read;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::control::{TestRequest, TestResponse};
use crate::core::cancel::CancelToken;
use crate::core::error::{Error, ErrorKind};
use crate::engine::Engine;
use crate::speedtest::{LatencyProbe, effective_timeout, proxied_agent};

const DEFAULT_LATENCY_URL: &str = "http://cp.cloudflare.com/";
const DEFAULT_SPEED_TIMEOUT: Duration = Duration::from_secs(10);
const EGRESS_TRACE_URL: &str = "https://www.cloudflare.com/cdn-cgi/trace";
const SPEED_CHUNK: usize = 32 * 1024;

pub trait FullTestRunner: Send + Sync {
    fn run(
        &self,
        cancel: &CancelToken,
        request: &TestRequest,
        engine: &dyn Engine,
    ) -> Result<TestResponse, Error>;
}

pub struct BasicFullTest {
    latency: Arc<dyn LatencyProbe>,
}

impl BasicFullTest {
    pub fn new(latency: Arc<dyn LatencyProbe>) -> Self {
        Self { latency }
    }

    fn download(
        &self,
        cancel: &CancelToken,
        engine: &dyn Engine,
        url: &str,
        window: Duration,
    ) -> Result<f64, Error> {
        let agent = proxied_agent(engine, window)?;
        let response = match agent.get(url).call() {
            Ok(response) => response,
            Err(err) => {
                return Err(Error::new(ErrorKind::TestFailed)
                    .with_message(format!("download from {url} failed"))
                    .with_source(err));
            }
        };
        let mut reader = response.into_reader();
        let mut buffer = vec![0u8; SPEED_CHUNK];
        let mut total = 0u64;
        let started = Instant::now();
        while started.elapsed() < window {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => total += read as u64,
                // The agent timeout doubles as the measurement window.
                Err(_) if total > 0 => break,
                Err(err) => {
                    return Err(Error::new(ErrorKind::TestFailed)
                        .with_message("download stalled")
                        .with_source(err));
                }
            }
        }
        let seconds = started.elapsed().as_secs_f64().max(0.001);
        Ok(total as f64 / seconds)
    }

    fn egress_address(&self, engine: &dyn Engine, timeout: Duration) -> Result<String, Error> {
        let agent = proxied_agent(engine, timeout)?;
        let body = agent
            .get(EGRESS_TRACE_URL)
            .call()
            .map_err(|err| {
                Error::new(ErrorKind::TestFailed)
                    .with_message("egress lookup failed")
                    .with_source(err)
            })?
            .into_string()
            .map_err(|err| {
                Error::new(ErrorKind::TestFailed)
                    .with_message("egress lookup failed")
                    .with_source(err)
            })?;
        body.lines()
            .find_map(|line| line.strip_prefix("ip="))
            .map(str::to_string)
            .ok_or_else(|| {
                Error::new(ErrorKind::TestFailed).with_message("egress lookup returned no address")
            })
    }
}

impl FullTestRunner for BasicFullTest {
    fn run(
        &self,
        cancel: &CancelToken,
        request: &TestRequest,
        engine: &dyn Engine,
    ) -> Result<TestResponse, Error> {
        let timeout = effective_timeout(Duration::from_millis(u64::from(request.timeout)));
        let mut report = Vec::new();
        let mut ms = 0;

        if request.full_latency {
            let url = non_empty(&request.url).unwrap_or(DEFAULT_LATENCY_URL);
            match self.latency.url_test(engine, url, timeout) {
                Ok(value) => {
                    ms = value;
                    report.push(format!("Latency: {value}ms"));
                }
                Err(err) => report.push(format!("Latency: {}", err.wire_message())),
            }
        }
        check(cancel)?;

        if request.full_udp_latency {
            report.push("UDP Latency: unsupported".to_string());
        }

        if request.full_speed {
            match non_empty(&request.full_speed_url) {
                Some(url) => {
                    let window = match request.full_speed_timeout {
                        0 => DEFAULT_SPEED_TIMEOUT,
                        seconds => Duration::from_secs(u64::from(seconds)),
                    };
                    match self.download(cancel, engine, url, window) {
                        Ok(rate) => report.push(format!("Download: {}", format_rate(rate))),
                        Err(err) if err.kind() == ErrorKind::Cancelled => return Err(err),
                        Err(err) => report.push(format!("Download: {}", err.wire_message())),
                    }
                }
                None => report.push("Download: no speed test url".to_string()),
            }
        }
        check(cancel)?;

        if request.full_in_out {
            match non_empty(&request.in_address) {
                Some(address) => report.push(format!("In: {}", ingress_address(address))),
                None => report.push("In: unknown".to_string()),
            }
            match self.egress_address(engine, timeout) {
                Ok(address) => report.push(format!("Out: {address}")),
                Err(err) => report.push(format!("Out: {}", err.wire_message())),
            }
        }
        check(cancel)?;

        let full_report = report.join(" / ");
        debug!(report = %full_report, "full test finished");
        Ok(TestResponse {
            ms,
            error: None,
            full_report: Some(full_report),
        })
    }
}

/// Resolves the server address a profile dials, for the report's `In` field.
fn ingress_address(address: &str) -> String {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return ip.to_string();
    }
    if let Ok(socket) = address.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }
    let resolved = address
        .to_socket_addrs()
        .or_else(|_| (address, 0).to_socket_addrs())
        .ok()
        .and_then(|mut addrs| addrs.next());
    match resolved {
        Some(resolved) => resolved.ip().to_string(),
        None => format!("{address} (unresolved)"),
    }
}

fn format_rate(bytes_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_second;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2}{}", UNITS[unit])
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn check(cancel: &CancelToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    Ok(())
}

fn cancelled() -> Error {
    Error::new(ErrorKind::Cancelled).with_message("full test cancelled")
}
