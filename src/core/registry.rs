//! Purpose: Hold the single active plugin shared by all request handlers.
//! Exports: `PluginRegistry`, `PLUGIN_KEY`.
//! Role: Explicitly constructed slot; populated before serving, overwritten on reload.
//! Invariants: At most one entry exists, stored under `PLUGIN_KEY`; the latest store wins.
//! Invariants: `retrieve` never blocks on a future store; absence is a returned error.
//! Invariants: Calls holding a previously retrieved handle are not drained on overwrite.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::core::error::{Error, ErrorKind};
use crate::core::plugin::PluginHandle;

/// Fixed logical name of the registry slot.
pub const PLUGIN_KEY: &str = "code";

const EMPTY_MESSAGE: &str = "no plugin";

#[derive(Default)]
pub struct PluginRegistry {
    slot: RwLock<Option<Arc<dyn PluginHandle>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self) -> &'static str {
        PLUGIN_KEY
    }

    /// Install `handle`, replacing whatever was stored before.
    ///
    /// The previous handle is dropped from the slot only; any caller that already
    /// retrieved it keeps a live reference until its call returns.
    pub fn store(&self, handle: Arc<dyn PluginHandle>) {
        let previous = {
            let mut slot = self.slot.write().unwrap_or_else(|poison| poison.into_inner());
            slot.replace(handle)
        };
        if previous.is_some() {
            tracing::info!(key = PLUGIN_KEY, "replaced stored plugin");
        } else {
            tracing::info!(key = PLUGIN_KEY, "stored plugin");
        }
    }

    pub fn retrieve(&self) -> Result<Arc<dyn PluginHandle>, Error> {
        let slot = self.slot.read().unwrap_or_else(|poison| poison.into_inner());
        match slot.as_ref() {
            Some(handle) => Ok(Arc::clone(handle)),
            None => Err(Error::new(ErrorKind::RegistryEmpty)
                .with_message(EMPTY_MESSAGE)
                .with_hint("Load a plugin before serving requests.")),
        }
    }

    pub fn is_populated(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .is_some()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("key", &PLUGIN_KEY)
            .field("populated", &self.is_populated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{PLUGIN_KEY, PluginRegistry};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::plugin::PluginHandle;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    struct Named(&'static str);

    impl PluginHandle for Named {
        fn call(&self, _function: &str, _input: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    fn name_of(handle: &Arc<dyn PluginHandle>) -> String {
        let out = handle.call("handle", b"").expect("call");
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn retrieve_on_empty_registry_fails_with_stable_message() {
        let registry = PluginRegistry::new();
        let first = registry.retrieve().err().expect("empty");
        let second = registry.retrieve().err().expect("empty");
        assert_eq!(first.kind(), ErrorKind::RegistryEmpty);
        assert_eq!(first.message(), Some("no plugin"));
        assert_eq!(first.message(), second.message());
        assert!(!registry.is_populated());
    }

    #[test]
    fn store_then_retrieve_returns_stored_handle() {
        let registry = PluginRegistry::new();
        registry.store(Arc::new(Named("p")));
        let handle = registry.retrieve().expect("stored");
        assert_eq!(name_of(&handle), "p");
        assert!(registry.is_populated());
    }

    #[test]
    fn latest_store_wins() {
        let registry = PluginRegistry::new();
        registry.store(Arc::new(Named("p")));
        assert_eq!(name_of(&registry.retrieve().expect("p")), "p");
        registry.store(Arc::new(Named("q")));
        assert_eq!(name_of(&registry.retrieve().expect("q")), "q");
    }

    #[test]
    fn overwrite_releases_previous_handle_from_slot() {
        let registry = PluginRegistry::new();
        let first: Arc<dyn PluginHandle> = Arc::new(Named("p"));
        registry.store(Arc::clone(&first));
        assert_eq!(Arc::strong_count(&first), 2);
        registry.store(Arc::new(Named("q")));
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn registries_are_independent() {
        let left = PluginRegistry::new();
        let right = PluginRegistry::new();
        left.store(Arc::new(Named("left")));
        assert!(left.retrieve().is_ok());
        assert_eq!(
            right.retrieve().err().map(|err| err.kind()),
            Some(ErrorKind::RegistryEmpty)
        );
        assert_eq!(right.key(), PLUGIN_KEY);
    }

    #[test]
    fn concurrent_retrieve_returns_same_handle() {
        let registry = PluginRegistry::new();
        let stored: Arc<dyn PluginHandle> = Arc::new(Named("shared"));
        registry.store(Arc::clone(&stored));

        let workers = 16;
        let barrier = Barrier::new(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry.retrieve().expect("retrieve")
                    })
                })
                .collect();
            for handle in handles {
                let retrieved = handle.join().expect("join");
                assert!(std::ptr::addr_eq(
                    Arc::as_ptr(&retrieved),
                    Arc::as_ptr(&stored)
                ));
            }
        });
    }

    struct Slow {
        started: Arc<Barrier>,
        finished: Arc<AtomicBool>,
    }

    impl PluginHandle for Slow {
        fn call(&self, _function: &str, _input: &[u8]) -> Result<Vec<u8>, Error> {
            self.started.wait();
            std::thread::sleep(Duration::from_millis(50));
            self.finished.store(true, Ordering::SeqCst);
            Ok(b"old".to_vec())
        }
    }

    #[test]
    fn in_flight_call_completes_against_replaced_handle() {
        let registry = PluginRegistry::new();
        let started = Arc::new(Barrier::new(2));
        let finished = Arc::new(AtomicBool::new(false));
        registry.store(Arc::new(Slow {
            started: Arc::clone(&started),
            finished: Arc::clone(&finished),
        }));

        let old = registry.retrieve().expect("old");
        let worker = std::thread::spawn(move || old.call("handle", b""));

        started.wait();
        registry.store(Arc::new(Named("new")));
        assert_eq!(name_of(&registry.retrieve().expect("new")), "new");

        let out = worker.join().expect("join").expect("call");
        assert_eq!(out, b"old");
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_store_and_retrieve_never_observe_empty() {
        let registry = PluginRegistry::new();
        registry.store(Arc::new(Named("a")));

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    let name = if i % 2 == 0 { "a" } else { "b" };
                    registry.store(Arc::new(Named(name)));
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let handle = registry.retrieve().expect("populated");
                        let name = name_of(&handle);
                        assert!(name == "a" || name == "b");
                    }
                });
            }
        });
    }
}
