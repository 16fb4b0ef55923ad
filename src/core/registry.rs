//! Purpose: Own the single active engine instance for the process.
//! Exports: `InstanceRegistry`, `EngineInstance`, `TransientInstance`.
//! Role: Lifecycle state behind Start/Stop; spawner for transient Test engines.
//! Invariants: At most one instance is registered at any time.
//! Invariants: Acquire/Release serialize on the lifecycle lock; `current` only
//! takes the slot lock, which is never held across engine creation/teardown.
//! Invariants: A failed Acquire leaves the slot empty (no half-registered state).
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::error::{Error, ErrorKind};
use crate::engine::{Engine, EngineFactory, Spawned};

pub struct EngineInstance {
    config: Vec<u8>,
    engine: Arc<dyn Engine>,
    teardown: CancelToken,
}

impl EngineInstance {
    pub fn config(&self) -> &[u8] {
        &self.config
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn is_running(&self) -> bool {
        !self.teardown.is_cancelled()
    }

    fn shutdown(&self) -> Result<(), Error> {
        self.teardown.cancel();
        self.engine.close()
    }
}

/// An engine owned by a single call; torn down when dropped.
pub struct TransientInstance {
    instance: EngineInstance,
}

impl TransientInstance {
    pub fn engine(&self) -> &dyn Engine {
        self.instance.engine()
    }
}

impl Drop for TransientInstance {
    fn drop(&mut self) {
        if let Err(err) = self.instance.shutdown() {
            warn!(error = %err, "transient engine teardown failed");
        }
    }
}

pub struct InstanceRegistry {
    factory: Arc<dyn EngineFactory>,
    lifecycle: Mutex<()>,
    slot: RwLock<Option<Arc<EngineInstance>>>,
}

impl InstanceRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            lifecycle: Mutex::new(()),
            slot: RwLock::new(None),
        }
    }

    /// Creates and registers an engine.
    ///
    /// `prepare` runs on the new instance before it becomes visible through
    /// `current`; if it fails the instance is torn down and the slot stays
    /// empty.
    pub fn acquire(
        &self,
        config: &[u8],
        cancel: &CancelToken,
        prepare: impl FnOnce(&EngineInstance) -> Result<(), Error>,
    ) -> Result<Arc<EngineInstance>, Error> {
        let _lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.current().is_some() {
            return Err(Error::new(ErrorKind::AlreadyRunning).with_message("instance already started"));
        }

        let instance = self.create(config, cancel)?;
        if let Err(err) = prepare(&instance) {
            if let Err(teardown_err) = instance.shutdown() {
                warn!(error = %teardown_err, "teardown after failed preparation also failed");
            }
            return Err(err);
        }

        let instance = Arc::new(instance);
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&instance));
        info!("engine instance started");
        Ok(instance)
    }

    /// Tears down the registered engine, if any.
    ///
    /// The slot is emptied even when teardown reports an error.
    pub fn release(&self) -> Result<(), Error> {
        let _lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let taken = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(instance) => {
                let result = instance.shutdown();
                info!("engine instance stopped");
                result
            }
            None => {
                debug!("release with no active instance");
                Ok(())
            }
        }
    }

    pub fn current(&self) -> Option<Arc<EngineInstance>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Creates an engine that never enters the slot.
    pub fn spawn(&self, config: &[u8], cancel: &CancelToken) -> Result<TransientInstance, Error> {
        let instance = self.create(config, cancel)?;
        Ok(TransientInstance { instance })
    }

    fn create(&self, config: &[u8], cancel: &CancelToken) -> Result<EngineInstance, Error> {
        if cancel.is_cancelled() {
            return Err(Error::new(ErrorKind::Cancelled).with_message("engine creation cancelled"));
        }
        let Spawned { engine, teardown } =
            self.factory.create(config, cancel).map_err(|err| match err.kind() {
                ErrorKind::EngineCreation | ErrorKind::Cancelled => err,
                _ => Error::new(ErrorKind::EngineCreation).with_message(err.wire_message()),
            })?;
        Ok(EngineInstance {
            config: config.to_vec(),
            engine,
            teardown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{StatsOptions, StatsService};
    use crate::core::probe::Introspect;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct NoOptions(Vec<String>);

    impl Introspect for NoOptions {}

    impl StatsOptions for NoOptions {
        fn outbounds(&self) -> &[String] {
            &self.0
        }

        fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
            self
        }
    }

    struct CountingEngine {
        closed: Arc<AtomicUsize>,
    }

    impl Engine for CountingEngine {
        fn new_stats_options(&self, outbounds: Vec<String>) -> Box<dyn StatsOptions> {
            Box::new(NoOptions(outbounds))
        }

        fn install_stats(&self, _options: Box<dyn StatsOptions>) -> Result<(), Error> {
            Ok(())
        }

        fn stats(&self) -> Option<Arc<dyn StatsService>> {
            None
        }

        fn close(&self) -> Result<(), Error> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Factory {
        created: AtomicUsize,
        closed: Arc<AtomicUsize>,
        gate: Option<Mutex<mpsc::Receiver<()>>>,
    }

    impl Factory {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
                gate: None,
            }
        }
    }

    impl EngineFactory for Factory {
        fn create(&self, config: &[u8], _cancel: &CancelToken) -> Result<Spawned, Error> {
            if let Some(gate) = &self.gate {
                let _ = gate.lock().expect("gate").recv();
            }
            if config == b"broken" {
                return Err(Error::new(ErrorKind::Usage).with_message("decode config: unexpected EOF"));
            }
            if config == b"busy" {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("bind 127.0.0.1:2080")
                    .with_source(std::io::Error::other("address in use")));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Spawned {
                engine: Arc::new(CountingEngine {
                    closed: Arc::clone(&self.closed),
                }),
                teardown: CancelToken::new(),
            })
        }
    }

    fn no_prepare(_: &EngineInstance) -> Result<(), Error> {
        Ok(())
    }

    #[test]
    fn acquire_then_release_round_trips_state() {
        let factory = Arc::new(Factory::new());
        let registry = InstanceRegistry::new(factory.clone());
        let cancel = CancelToken::new();

        let instance = registry.acquire(b"{}", &cancel, no_prepare).expect("acquire");
        assert_eq!(instance.config(), b"{}");
        assert!(registry.current().is_some());

        registry.release().expect("release");
        assert!(registry.current().is_none());
        assert!(!instance.is_running());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_acquire_is_rejected_and_first_untouched() {
        let factory = Arc::new(Factory::new());
        let registry = InstanceRegistry::new(factory.clone());
        let cancel = CancelToken::new();

        let first = registry.acquire(b"{}", &cancel, no_prepare).expect("acquire");
        let err = registry
            .acquire(b"{}", &cancel, no_prepare)
            .err()
            .expect("already running");
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
        assert!(first.is_running());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        let current = registry.current().expect("current");
        assert!(Arc::ptr_eq(&first, &current));
    }

    #[test]
    fn factory_failure_leaves_slot_empty_with_message() {
        let registry = InstanceRegistry::new(Arc::new(Factory::new()));
        let cancel = CancelToken::new();

        let err = registry
            .acquire(b"broken", &cancel, no_prepare)
            .err()
            .expect("creation error");
        assert_eq!(err.kind(), ErrorKind::EngineCreation);
        assert_eq!(err.wire_message(), "decode config: unexpected EOF");
        assert!(registry.current().is_none());

        registry.acquire(b"{}", &cancel, no_prepare).expect("next start accepted");
    }

    #[test]
    fn factory_error_with_source_is_reported_once() {
        let registry = InstanceRegistry::new(Arc::new(Factory::new()));
        let err = registry
            .acquire(b"busy", &CancelToken::new(), no_prepare)
            .err()
            .expect("creation error");
        assert_eq!(err.kind(), ErrorKind::EngineCreation);
        assert_eq!(err.wire_message(), "bind 127.0.0.1:2080: address in use");
    }

    #[test]
    fn failed_preparation_tears_down_and_leaves_slot_empty() {
        let factory = Arc::new(Factory::new());
        let registry = InstanceRegistry::new(factory.clone());
        let cancel = CancelToken::new();

        let err = registry
            .acquire(b"{}", &cancel, |_| {
                Err(Error::new(ErrorKind::Engine).with_message("stats rejected"))
            })
            .err()
            .expect("prepare error");
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert!(registry.current().is_none());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_without_instance_is_noop() {
        let registry = InstanceRegistry::new(Arc::new(Factory::new()));
        registry.release().expect("noop");
        registry.release().expect("still noop");
    }

    #[test]
    fn cancelled_token_aborts_creation() {
        let factory = Arc::new(Factory::new());
        let registry = InstanceRegistry::new(factory.clone());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = registry
            .acquire(b"{}", &cancel, no_prepare)
            .err()
            .expect("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transient_instance_is_torn_down_on_drop() {
        let factory = Arc::new(Factory::new());
        let registry = InstanceRegistry::new(factory.clone());
        let cancel = CancelToken::new();

        {
            let _transient = registry.spawn(b"{}", &cancel).expect("spawn");
            assert!(registry.current().is_none());
        }
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn current_is_not_blocked_by_slow_creation() {
        let (release_gate, gate) = mpsc::channel();
        let factory = Arc::new(Factory {
            gate: Some(Mutex::new(gate)),
            ..Factory::new()
        });
        let registry = Arc::new(InstanceRegistry::new(factory));

        let starter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry
                    .acquire(b"{}", &CancelToken::new(), no_prepare)
                    .map(|_| ())
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.current().is_none());

        release_gate.send(()).expect("open gate");
        starter.join().expect("join").expect("acquire");
        assert!(registry.current().is_some());
    }
}
