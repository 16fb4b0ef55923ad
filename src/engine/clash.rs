//! Purpose: Stats subsystem backed by the engine's Clash-compatible controller.
//! Exports: `ClashStatsOptions`, `ClashStats`, `controller_url`.
//! Role: Connection listing for process-backed engines via `GET /connections`.
//! Invariants: Listing is only exposed when connection tracking was enabled
//! and a controller address is configured.
//! Notes: The controller has no per-outbound counters, so `traffic` is absent
//! and QueryStats degrades to zero for these engines.
use std::any::Any;
use std::io::Read;
use std::time::Duration;

use url::Url;

use super::{StatsOptions, StatsService};
use crate::core::probe::{Field, Introspect, Method, RawPayload, Returned};

const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_LISTING_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct ClashStatsOptions {
    enabled: bool,
    outbounds: Vec<String>,
    track_connections: bool,
}

impl ClashStatsOptions {
    pub fn new(outbounds: Vec<String>) -> Self {
        Self {
            enabled: true,
            outbounds,
            track_connections: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn track_connections(&self) -> bool {
        self.track_connections
    }
}

impl Introspect for ClashStatsOptions {
    fn field_mut(&mut self, name: &str) -> Option<Field<'_>> {
        match name {
            "Enabled" => Some(Field::Bool(&mut self.enabled)),
            "EnableConnections" => Some(Field::Bool(&mut self.track_connections)),
            "Outbounds" => Some(Field::Other),
            _ => None,
        }
    }
}

impl StatsOptions for ClashStatsOptions {
    fn outbounds(&self) -> &[String] {
        &self.outbounds
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

pub struct ClashStats {
    controller: Option<Url>,
    secret: Option<String>,
    options: ClashStatsOptions,
    agent: ureq::Agent,
}

impl ClashStats {
    pub fn new(controller: Option<Url>, secret: Option<String>, options: ClashStatsOptions) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(CONTROLLER_TIMEOUT)
            .build();
        Self {
            controller,
            secret,
            options,
            agent,
        }
    }

    fn fetch_connections(&self, controller: &Url) -> Result<RawPayload, String> {
        let url = controller
            .join("connections")
            .map_err(|err| format!("invalid controller url: {err}"))?;
        let mut request = self.agent.get(url.as_str());
        if let Some(secret) = self.secret.as_deref().filter(|secret| !secret.is_empty()) {
            request = request.set("Authorization", &format!("Bearer {secret}"));
        }
        let response = request.call().map_err(|err| err.to_string())?;
        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_LISTING_BYTES)
            .read_to_end(&mut body)
            .map_err(|err| err.to_string())?;
        Ok(RawPayload::Bytes(body))
    }
}

impl Introspect for ClashStats {
    fn method(&self, name: &str) -> Option<Method<'_>> {
        if name != "Connections" || !self.options.enabled || !self.options.track_connections {
            return None;
        }
        let controller = self.controller.as_ref()?;
        Some(Method::accessor(move || {
            Returned::Fallible(self.fetch_connections(controller))
        }))
    }
}

impl StatsService for ClashStats {}

/// Turns an `external_controller` listen address into a loopback-reachable URL.
pub fn controller_url(listen: &str) -> Option<Url> {
    let listen = listen.trim();
    if listen.is_empty() {
        return None;
    }
    let mut url = Url::parse(&format!("http://{listen}/")).ok()?;
    let unspecified = matches!(url.host_str(), Some("0.0.0.0") | Some("[::]"));
    if unspecified {
        url.set_host(Some("127.0.0.1")).ok()?;
    }
    Some(url)
}
