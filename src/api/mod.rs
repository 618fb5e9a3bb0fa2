//! Purpose: Define the public Rust API boundary for the plugin host.
//! Exports: Core types and operations needed by the binary and embedders.
//! Role: Public, additive-only surface over `core`.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::body::{BodyReadMode, read_body, read_complete, read_single};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::loader::{
    LoadOptions, LoadReport, LoadedPlugin, PluginSource, load_plugin, sha256_hex,
};
pub use crate::core::plugin::{ExtismPlugin, PluginHandle};
pub use crate::core::registry::{PLUGIN_KEY, PluginRegistry};
