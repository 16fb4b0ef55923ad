//! Purpose: Latency measurement collaborators used by the Test operation.
//! Exports: `LatencyProbe`, `NetLatency`, `DEFAULT_TIMEOUT`.
//! Role: URL round-trip timing through an engine's local proxy and plain TCP
//! connect timing.
//! Invariants: Results are whole milliseconds; a zero timeout means the default.
//! Invariants: URL tests only ever traffic through the engine under test.
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::engine::Engine;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_DRAIN_BYTES: u64 = 64 * 1024;

pub trait LatencyProbe: Send + Sync {
    /// Times one HTTP round trip to `url` through `engine`.
    fn url_test(&self, engine: &dyn Engine, url: &str, timeout: Duration) -> Result<u32, Error>;

    /// Times a TCP handshake with `address` (`host:port`).
    fn tcp_ping(&self, address: &str, timeout: Duration) -> Result<u32, Error>;
}

/// Network-backed latency probe.
///
/// URL tests issue a warm-up request first and report the second, so the
/// figure reflects round-trip time rather than proxy handshake cost.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetLatency;

impl LatencyProbe for NetLatency {
    fn url_test(&self, engine: &dyn Engine, url: &str, timeout: Duration) -> Result<u32, Error> {
        let timeout = effective_timeout(timeout);
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("url test requires a url"));
        }
        let agent = proxied_agent(engine, timeout)?;
        round_trip(&agent, url)?;
        let started = Instant::now();
        round_trip(&agent, url)?;
        let ms = elapsed_ms(started);
        debug!(url, ms, "url test finished");
        Ok(ms)
    }

    fn tcp_ping(&self, address: &str, timeout: Duration) -> Result<u32, Error> {
        let timeout = effective_timeout(timeout);
        let target = resolve(address)?;
        let started = Instant::now();
        let stream = TcpStream::connect_timeout(&target, timeout).map_err(|err| {
            let message = if err.kind() == io::ErrorKind::TimedOut {
                format!("tcp ping to {address} timed out")
            } else {
                format!("tcp ping to {address} failed")
            };
            Error::new(ErrorKind::TestFailed)
                .with_message(message)
                .with_source(err)
        })?;
        let ms = elapsed_ms(started);
        drop(stream);
        debug!(address, %target, ms, "tcp ping finished");
        Ok(ms)
    }
}

/// HTTP agent whose requests all leave through `engine`'s local inbound.
pub(crate) fn proxied_agent(engine: &dyn Engine, timeout: Duration) -> Result<ureq::Agent, Error> {
    let proxy_url = engine.proxy_url().ok_or_else(|| {
        Error::new(ErrorKind::TestFailed)
            .with_message("engine has no local http or mixed inbound to test through")
    })?;
    let proxy = ureq::Proxy::new(&proxy_url).map_err(|err| {
        Error::new(ErrorKind::TestFailed)
            .with_message(format!("invalid engine proxy {proxy_url}"))
            .with_source(err)
    })?;
    Ok(ureq::AgentBuilder::new()
        .proxy(proxy)
        .timeout(timeout)
        .build())
}

fn round_trip(agent: &ureq::Agent, url: &str) -> Result<(), Error> {
    let response = match agent.get(url).call() {
        Ok(response) => response,
        // Any HTTP status proves the path works.
        Err(ureq::Error::Status(_, response)) => response,
        Err(err) => {
            return Err(Error::new(ErrorKind::TestFailed)
                .with_message(format!("request to {url} failed"))
                .with_source(err));
        }
    };
    let _ = io::copy(
        &mut response.into_reader().take(MAX_DRAIN_BYTES),
        &mut io::sink(),
    );
    Ok(())
}

fn resolve(address: &str) -> Result<SocketAddr, Error> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("tcp ping requires an address"));
    }
    address
        .to_socket_addrs()
        .map_err(|err| {
            Error::new(ErrorKind::TestFailed)
                .with_message(format!("failed to resolve {address}"))
                .with_hint("Addresses use host:port form.")
                .with_source(err)
        })?
        .next()
        .ok_or_else(|| {
            Error::new(ErrorKind::TestFailed).with_message(format!("{address} resolved to nothing"))
        })
}

pub(crate) fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        timeout
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u32 {
    u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX)
}
