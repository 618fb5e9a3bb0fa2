//! Purpose: Model a loaded plugin as a callable capability.
//! Exports: `PluginHandle`, `ExtismPlugin`.
//! Role: Seam between the registry/HTTP glue and the WASM execution engine.
//! Invariants: Callers only see `call(function, input) -> output`; engine errors stay opaque.
//! Invariants: One Extism instance executes one call at a time.

use std::fmt;
use std::sync::Mutex;

use crate::core::error::{Error, ErrorKind};

/// A loaded, callable plugin instance.
///
/// Implementations must be shareable across request handlers; the registry hands
/// out `Arc<dyn PluginHandle>` clones and never coordinates with calls in flight.
pub trait PluginHandle: Send + Sync {
    fn call(&self, function: &str, input: &[u8]) -> Result<Vec<u8>, Error>;
}

/// `PluginHandle` backed by an Extism WASM instance.
pub struct ExtismPlugin {
    inner: Mutex<extism::Plugin>,
}

impl ExtismPlugin {
    pub fn new(plugin: extism::Plugin) -> Self {
        Self {
            inner: Mutex::new(plugin),
        }
    }

    pub fn function_exists(&self, function: &str) -> bool {
        let plugin = self
            .inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        plugin.function_exists(function)
    }
}

impl PluginHandle for ExtismPlugin {
    fn call(&self, function: &str, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut plugin = self
            .inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        plugin
            .call::<&[u8], Vec<u8>>(function, input)
            .map_err(|err| {
                Error::new(ErrorKind::PluginCall)
                    .with_message(err.to_string())
                    .with_boxed_source(err.into())
            })
    }
}

impl fmt::Debug for ExtismPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtismPlugin").finish_non_exhaustive()
    }
}
