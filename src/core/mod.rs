// Core modules implementing the plugin slot, body ingestion, loading, and error modeling.
pub mod body;
pub mod error;
pub mod loader;
pub mod plugin;
pub mod registry;
