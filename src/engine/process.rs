//! Purpose: Engine adapter that runs the routing engine as a child process.
//! Exports: `ProcessEngineConfig`, `ProcessEngineFactory`, `ProcessEngine`.
//! Role: Default `EngineFactory` for the binary (`<engine> run -c <file>`).
//! Invariants: Each engine owns one config file and one child; both are
//! removed on close or drop.
//! Invariants: Startup waits at most `startup_grace` and aborts on cancellation.
//! Notes: Engine stderr is forwarded to tracing under the `engine` target.
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::clash::{ClashStats, ClashStatsOptions, controller_url};
use super::{Engine, EngineFactory, Spawned, StatsOptions, StatsService};
use crate::core::cancel::CancelToken;
use crate::core::error::{Error, ErrorKind};

const STARTUP_POLL: Duration = Duration::from_millis(20);
const STDERR_TAIL_LINES: usize = 8;

#[derive(Clone, Debug)]
pub struct ProcessEngineConfig {
    pub program: PathBuf,
    pub work_dir: PathBuf,
    pub startup_grace: Duration,
}

pub struct ProcessEngineFactory {
    config: ProcessEngineConfig,
    next_id: AtomicU64,
}

impl ProcessEngineFactory {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
        }
    }

    fn config_path(&self) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.config
            .work_dir
            .join(format!("engine-{}-{id}.json", std::process::id()))
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(&self, config: &[u8], cancel: &CancelToken) -> Result<Spawned, Error> {
        let layout = ConfigLayout::parse(config)?;

        std::fs::create_dir_all(&self.config.work_dir).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create engine work dir")
                .with_source(err)
        })?;
        let config_path = self.config_path();
        std::fs::write(&config_path, config).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write engine config")
                .with_source(err)
        })?;

        let spawned = Command::new(&self.config.program)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .current_dir(&self.config.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                remove_config(&config_path);
                return Err(Error::new(ErrorKind::EngineCreation)
                    .with_message(format!(
                        "failed to launch engine {}",
                        self.config.program.display()
                    ))
                    .with_hint("Point --engine at the routing engine binary.")
                    .with_source(err));
            }
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, Arc::clone(&stderr_tail));
        }

        if let Err(err) = wait_for_startup(&mut child, self.config.startup_grace, cancel, &stderr_tail)
        {
            stop_child(&mut child);
            remove_config(&config_path);
            return Err(err);
        }
        info!(pid = child.id(), config = %config_path.display(), "engine process started");

        let teardown = CancelToken::new();
        let engine = ProcessEngine {
            child: Mutex::new(Some(child)),
            config_path,
            layout,
            stats: RwLock::new(None),
            teardown: teardown.clone(),
        };
        Ok(Spawned {
            engine: Arc::new(engine),
            teardown,
        })
    }
}

pub struct ProcessEngine {
    child: Mutex<Option<Child>>,
    config_path: PathBuf,
    layout: ConfigLayout,
    stats: RwLock<Option<Arc<dyn StatsService>>>,
    teardown: CancelToken,
}

impl Engine for ProcessEngine {
    fn new_stats_options(&self, outbounds: Vec<String>) -> Box<dyn StatsOptions> {
        Box::new(ClashStatsOptions::new(outbounds))
    }

    fn install_stats(&self, options: Box<dyn StatsOptions>) -> Result<(), Error> {
        let options = options.into_any().downcast::<ClashStatsOptions>().map_err(|_| {
            Error::new(ErrorKind::Engine).with_message("stats options were built by another engine")
        })?;
        let controller = self.layout.controller();
        if controller.is_none() && options.track_connections() {
            debug!("connection tracking requested but no clash_api controller is configured");
        }
        let stats = ClashStats::new(controller, self.layout.controller_secret(), *options);
        *self.stats.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(stats));
        Ok(())
    }

    fn stats(&self) -> Option<Arc<dyn StatsService>> {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn proxy_url(&self) -> Option<String> {
        self.layout.proxy_url()
    }

    fn close(&self) -> Result<(), Error> {
        self.teardown.cancel();
        let taken = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut child) = taken else {
            return Ok(());
        };
        let pid = child.id();
        let result = match child.try_wait() {
            Ok(Some(status)) => {
                warn!(pid, %status, "engine process had already exited");
                Ok(())
            }
            Ok(None) => child
                .kill()
                .and_then(|()| child.wait().map(|_| ()))
                .map_err(|err| {
                    Error::new(ErrorKind::Engine)
                        .with_message("failed to stop engine process")
                        .with_source(err)
                }),
            Err(err) => Err(Error::new(ErrorKind::Engine)
                .with_message("failed to query engine process")
                .with_source(err)),
        };
        remove_config(&self.config_path);
        info!(pid, "engine process stopped");
        result
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        let taken = self
            .child
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = taken {
            stop_child(&mut child);
            remove_config(&self.config_path);
        }
    }
}

/// The parts of an engine configuration this adapter needs to read.
#[derive(Debug, Default, Deserialize)]
struct ConfigLayout {
    #[serde(default)]
    inbounds: Vec<InboundLayout>,
    #[serde(default)]
    experimental: Option<ExperimentalLayout>,
}

#[derive(Debug, Deserialize)]
struct InboundLayout {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    listen: Option<String>,
    #[serde(default)]
    listen_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct ExperimentalLayout {
    #[serde(default)]
    clash_api: Option<ClashApiLayout>,
}

#[derive(Debug, Default, Deserialize)]
struct ClashApiLayout {
    #[serde(default)]
    external_controller: Option<String>,
    #[serde(default)]
    secret: Option<String>,
}

impl ConfigLayout {
    fn parse(config: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(config).map_err(|err| {
            Error::new(ErrorKind::EngineCreation)
                .with_message("decode config")
                .with_source(err)
        })
    }

    fn proxy_url(&self) -> Option<String> {
        self.inbounds
            .iter()
            .filter(|inbound| matches!(inbound.kind.as_str(), "mixed" | "http"))
            .find_map(|inbound| {
                let port = inbound.listen_port?;
                let host = match inbound.listen.as_deref() {
                    None | Some("") | Some("0.0.0.0") => "127.0.0.1",
                    Some("::") => "::1",
                    Some(listen) => listen,
                };
                let host = if host.contains(':') {
                    format!("[{host}]")
                } else {
                    host.to_string()
                };
                Some(format!("http://{host}:{port}"))
            })
    }

    fn controller(&self) -> Option<Url> {
        self.clash_api()
            .and_then(|api| api.external_controller.as_deref())
            .and_then(controller_url)
    }

    fn controller_secret(&self) -> Option<String> {
        self.clash_api().and_then(|api| api.secret.clone())
    }

    fn clash_api(&self) -> Option<&ClashApiLayout> {
        self.experimental
            .as_ref()
            .and_then(|experimental| experimental.clash_api.as_ref())
    }
}

fn wait_for_startup(
    child: &mut Child,
    grace: Duration,
    cancel: &CancelToken,
    stderr_tail: &Mutex<VecDeque<String>>,
) -> Result<(), Error> {
    let started = Instant::now();
    loop {
        let exited = child.try_wait().map_err(|err| {
            Error::new(ErrorKind::EngineCreation)
                .with_message("failed to query engine process")
                .with_source(err)
        })?;
        if let Some(status) = exited {
            // Give the forwarder a moment to collect the final lines.
            std::thread::sleep(STARTUP_POLL);
            let tail = stderr_tail
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            let mut message = format!("engine exited during startup ({status})");
            if !tail.is_empty() {
                message.push_str(": ");
                message.push_str(&tail);
            }
            return Err(Error::new(ErrorKind::EngineCreation).with_message(message));
        }
        let elapsed = started.elapsed();
        if elapsed >= grace {
            return Ok(());
        }
        if !cancel.sleep(STARTUP_POLL.min(grace - elapsed)) {
            return Err(Error::new(ErrorKind::Cancelled).with_message("engine startup cancelled"));
        }
    }
}

fn forward_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let spawned = std::thread::Builder::new()
        .name("engine-stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else {
                    break;
                };
                debug!(target: "engine", "{line}");
                let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to start engine log forwarder");
    }
}

fn stop_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn remove_config(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %err, "failed to remove engine config");
        }
    }
}
