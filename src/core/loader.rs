//! Purpose: Resolve, verify, and instantiate the WASM module behind the registry slot.
//! Exports: `PluginSource`, `LoadOptions`, `LoadReport`, `LoadedPlugin`, `load_plugin`.
//! Role: Startup and reload path; the only place that touches Extism manifests.
//! Invariants: An expected sha256 is checked before the module is compiled.
//! Invariants: When a function is named, a module that does not export it fails to load.
//! Notes: Blocking (file/HTTP I/O and compilation); run off the async runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use extism::{Manifest, PluginBuilder, Wasm};
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::core::error::{Error, ErrorKind};
use crate::core::plugin::ExtismPlugin;

/// WASM linear memory is allocated in 64 KiB pages.
const WASM_PAGE_BYTES: u64 = 64 * 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PluginSource {
    Path(PathBuf),
    Url(Url),
}

impl PluginSource {
    /// `http://` and `https://` inputs are fetched; anything else is a local path.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("plugin source must not be empty")
                .with_hint("Pass --wasm with a .wasm path or an http(s) URL."));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = Url::parse(trimmed).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid plugin URL: {trimmed}"))
                    .with_source(err)
            })?;
            return Ok(Self::Url(url));
        }
        Ok(Self::Path(PathBuf::from(trimmed)))
    }

    fn fetch(&self) -> Result<Vec<u8>, Error> {
        match self {
            PluginSource::Path(path) => std::fs::read(path).map_err(|err| {
                Error::new(ErrorKind::PluginLoad)
                    .with_message("failed to read plugin module")
                    .with_path(path)
                    .with_hint("Check the --wasm path.")
                    .with_source(err)
            }),
            PluginSource::Url(url) => {
                let response = ureq::get(url.as_str()).call().map_err(|err| {
                    Error::new(ErrorKind::PluginLoad)
                        .with_message(format!("failed to download plugin module from {url}"))
                        .with_source(err)
                })?;
                let mut bytes = Vec::new();
                response
                    .into_reader()
                    .read_to_end(&mut bytes)
                    .map_err(|err| {
                        Error::new(ErrorKind::PluginLoad)
                            .with_message(format!("failed to read plugin module from {url}"))
                            .with_source(err)
                    })?;
                Ok(bytes)
            }
        }
    }
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginSource::Path(path) => write!(f, "{}", path.display()),
            PluginSource::Url(url) => write!(f, "{url}"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub wasi: bool,
    pub max_memory_bytes: Option<u64>,
    pub timeout: Option<Duration>,
    /// Key/value pairs readable by the guest through Extism config.
    pub config: BTreeMap<String, String>,
    pub allowed_hosts: Vec<String>,
    pub expected_sha256: Option<String>,
    /// Export that must be present for the load to succeed.
    pub function: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadReport {
    pub source: String,
    pub sha256: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub loaded_at: String,
}

#[derive(Debug)]
pub struct LoadedPlugin {
    pub plugin: ExtismPlugin,
    pub report: LoadReport,
}

pub fn load_plugin(source: &PluginSource, options: &LoadOptions) -> Result<LoadedPlugin, Error> {
    let bytes = source.fetch()?;
    let sha256 = sha256_hex(&bytes);
    verify_sha256(&sha256, options.expected_sha256.as_deref())?;

    let size_bytes = bytes.len() as u64;
    let manifest = build_manifest(bytes, options);
    let plugin = PluginBuilder::new(manifest)
        .with_wasi(options.wasi)
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::PluginLoad)
                .with_message(format!("failed to instantiate plugin: {err}"))
                .with_boxed_source(err.into())
        })?;
    let plugin = ExtismPlugin::new(plugin);

    if let Some(function) = options.function.as_deref() {
        if !plugin.function_exists(function) {
            return Err(Error::new(ErrorKind::PluginLoad)
                .with_message(format!("plugin does not export function `{function}`"))
                .with_hint("Pass --function with an exported name."));
        }
    }

    let report = LoadReport {
        source: source.to_string(),
        sha256,
        size_bytes,
        function: options.function.clone(),
        loaded_at: now_rfc3339().unwrap_or_default(),
    };
    tracing::info!(
        source = %report.source,
        sha256 = %report.sha256,
        size_bytes = report.size_bytes,
        "loaded plugin module"
    );
    Ok(LoadedPlugin { plugin, report })
}

fn build_manifest(bytes: Vec<u8>, options: &LoadOptions) -> Manifest {
    let mut manifest = Manifest::new([Wasm::data(bytes)]);
    if let Some(timeout) = options.timeout {
        manifest = manifest.with_timeout(timeout);
    }
    if let Some(max_bytes) = options.max_memory_bytes {
        let pages = max_bytes.div_ceil(WASM_PAGE_BYTES);
        manifest = manifest.with_memory_max(u32::try_from(pages).unwrap_or(u32::MAX));
    }
    for (key, value) in &options.config {
        manifest = manifest.with_config_key(key, value);
    }
    for host in &options.allowed_hosts {
        manifest = manifest.with_allowed_host(host);
    }
    manifest
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn verify_sha256(actual: &str, expected: Option<&str>) -> Result<(), Error> {
    let Some(expected) = expected else {
        tracing::debug!(sha256 = actual, "plugin module digest not pinned");
        return Ok(());
    };
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(Error::new(ErrorKind::PluginLoad)
            .with_message(format!(
                "plugin module sha256 mismatch (expected {expected}, got {actual})"
            ))
            .with_hint("Rebuild the module or update --sha256."));
    }
    Ok(())
}

fn now_rfc3339() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}
