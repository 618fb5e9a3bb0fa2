//! Purpose: `cracker-runner` CLI entry point.
//! Role: Binary crate root; parses args, builds configs, delegates to `command_dispatch`.
//! Invariants: Machine-readable output goes to stdout as JSON.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde::Serialize;
use serde_json::{Value, json};

mod command_dispatch;
mod serve;

use cracker_runner::api::{
    BodyReadMode, Error, ErrorKind, LoadOptions, PluginSource, to_exit_code,
};

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_FUNCTION: &str = "handle";

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `cracker-runner --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command)
        .map_err(add_plugin_load_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "cracker-runner",
    version,
    about = "Serve a WASM plugin over HTTP",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Loads one Extism plugin at startup and forwards every POST body to one of its exports.

Mental model:
  - `serve` loads the plugin and answers `POST /` with the plugin output
  - `check` loads the plugin and verifies the export without serving
"#,
    after_help = r#"EXAMPLES
  $ cracker-runner serve --wasm ./plugin.wasm --function handle
  $ curl -d '{"name":"Bob"}' http://127.0.0.1:8080/
  $ cracker-runner check --wasm https://example.com/plugin.wasm --function say_hello

LEARN MORE
  $ cracker-runner <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        global = true,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum BodyReadCli {
    Single,
    Complete,
}

impl From<BodyReadCli> for BodyReadMode {
    fn from(value: BodyReadCli) -> Self {
        match value {
            BodyReadCli::Single => BodyReadMode::SingleRead,
            BodyReadCli::Complete => BodyReadMode::Complete,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Load the plugin and serve it over HTTP",
        long_about = r#"Load the plugin, store it in the host's plugin slot, and serve HTTP.

POST / forwards the raw request body to the configured export and returns its output.
GET /healthz reports whether a plugin is loaded."#,
        after_help = r#"EXAMPLES
  $ cracker-runner serve --wasm ./plugin.wasm
  $ cracker-runner serve --wasm ./plugin.wasm --function say_hello --wasi
  $ cracker-runner serve --wasm ./plugin.wasm --config greeting=hello --body-read complete
  $ kill -HUP <pid>    # reload ./plugin.wasm without restarting

NOTES
  - Binds loopback only unless --allow-non-loopback is set
  - `--body-read single` (default) performs one read sized by Content-Length;
    bodies delivered in several pieces arrive zero-padded. Use `complete` to
    read the whole body and reject short ones.
  - RUST_LOG controls log verbosity (default: info)"#
    )]
    Serve(ServeArgs),
    #[command(
        about = "Load the plugin and verify its export without serving",
        long_about = r#"Load the plugin exactly as `serve` would and print a JSON load report."#,
        after_help = r#"EXAMPLES
  $ cracker-runner check --wasm ./plugin.wasm
  $ cracker-runner check --wasm ./plugin.wasm --sha256 <hex>

NOTES
  - Exits non-zero when the plugin cannot be loaded or lacks the export
  - Does not bind sockets"#
    )]
    Check(PluginArgs),
    #[command(
        about = "Print version info as JSON",
        after_help = r#"EXAMPLES
  $ cracker-runner version"#
    )]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ cracker-runner completion bash > ~/.local/share/bash-completion/completions/cracker-runner
  $ cracker-runner completion zsh > ~/.zfunc/_cracker-runner
  $ cracker-runner completion fish > ~/.config/fish/completions/cracker-runner.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Args, Clone, Debug)]
struct PluginArgs {
    #[arg(
        long,
        env = "CRACKER_WASM",
        value_name = "PATH|URL",
        help = "Plugin module: local .wasm path or http(s) URL",
        value_hint = ValueHint::AnyPath,
        help_heading = "Plugin"
    )]
    wasm: String,
    #[arg(
        long,
        env = "CRACKER_FUNCTION",
        default_value = DEFAULT_FUNCTION,
        help = "Exported function called for each request",
        help_heading = "Plugin"
    )]
    function: String,
    #[arg(long, help = "Enable WASI for the plugin", help_heading = "Plugin")]
    wasi: bool,
    #[arg(
        long = "config",
        value_name = "KEY=VALUE",
        help = "Plugin config value readable by the guest (repeatable)",
        help_heading = "Plugin"
    )]
    config: Vec<String>,
    #[arg(
        long = "allow-host",
        value_name = "HOST",
        help = "Host the plugin may reach over HTTP (repeatable)",
        help_heading = "Limits"
    )]
    allow_host: Vec<String>,
    #[arg(
        long,
        value_name = "BYTES",
        help = "Max plugin linear memory in bytes",
        help_heading = "Limits"
    )]
    max_memory_bytes: Option<u64>,
    #[arg(
        long,
        value_name = "MS",
        help = "Max execution time per plugin call in milliseconds",
        help_heading = "Limits"
    )]
    timeout_ms: Option<u64>,
    #[arg(
        long,
        value_name = "HEX",
        help = "Expected sha256 of the module; load fails on mismatch",
        help_heading = "Integrity"
    )]
    sha256: Option<String>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    plugin: PluginArgs,
    #[arg(
        long,
        env = "CRACKER_BIND",
        default_value = DEFAULT_BIND,
        help = "Bind address",
        help_heading = "Connection"
    )]
    bind: String,
    #[arg(
        long,
        help = "Allow non-loopback binds",
        help_heading = "Connection"
    )]
    allow_non_loopback: bool,
    #[arg(
        long,
        value_enum,
        default_value = "single",
        help = "Body ingestion: single (one read, zero-padded) | complete (read all, reject short)",
        help_heading = "Requests"
    )]
    body_read: BodyReadCli,
    #[arg(long, help = "Do not reload the plugin on SIGHUP", help_heading = "Plugin")]
    no_reload: bool,
}

fn plugin_source_and_options(args: PluginArgs) -> Result<(PluginSource, LoadOptions, String), Error> {
    let source = PluginSource::parse(&args.wasm)?;
    if args.function.trim().is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--function must not be empty")
            .with_hint("Use the name of an exported plugin function, like `handle`."));
    }
    if args.timeout_ms == Some(0) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--timeout-ms must be greater than zero")
            .with_hint("Use a positive value like 30000, or omit it for no limit."));
    }
    if args.max_memory_bytes == Some(0) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-memory-bytes must be greater than zero")
            .with_hint("Use a positive value like 67108864."));
    }
    let options = LoadOptions {
        wasi: args.wasi,
        max_memory_bytes: args.max_memory_bytes,
        timeout: args.timeout_ms.map(Duration::from_millis),
        config: parse_config_pairs(&args.config)?,
        allowed_hosts: args.allow_host,
        expected_sha256: args.sha256,
        function: Some(args.function.clone()),
    };
    Ok((source, options, args.function))
}

fn parse_config_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>, Error> {
    let mut config = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("invalid --config value: {pair}"))
                .with_hint("Use KEY=VALUE, for example --config greeting=hello."));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("--config key must not be empty: {pair}"))
                .with_hint("Use KEY=VALUE, for example --config greeting=hello."));
        }
        config.insert(key.to_string(), value.to_string());
    }
    Ok(config)
}

fn serve_config_from_args(args: ServeArgs) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:8080.")
    })?;
    let (source, load, function) = plugin_source_and_options(args.plugin)?;
    Ok(serve::ServeConfig {
        bind,
        allow_non_loopback: args.allow_non_loopback,
        source,
        load,
        function,
        body_mode: args.body_read.into(),
        reload_on_hangup: !args.no_reload,
    })
}

fn add_plugin_load_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::PluginLoad || err.hint().is_some() {
        return err;
    }
    err.with_hint("Run `cracker-runner check --wasm <module>` to inspect the plugin.")
}

fn emit_json(value: Value) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("cracker-runner {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "cracker-runner",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

/// Flattened view of an [`Error`] shared by the JSON and terminal renderers.
#[derive(Serialize)]
struct ErrorReport {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    causes: Vec<String>,
}

impl ErrorReport {
    fn from_error(err: &Error) -> Self {
        let message = err.message().map(str::to_string).unwrap_or_else(|| {
            match err.kind() {
                ErrorKind::Internal => "internal error",
                ErrorKind::Usage => "usage error",
                ErrorKind::RegistryEmpty => "no plugin",
                ErrorKind::PluginLoad => "plugin failed to load",
                ErrorKind::PluginCall => "plugin call failed",
                ErrorKind::Io => "i/o error",
            }
            .to_string()
        });
        let mut causes = Vec::new();
        let mut cur = err.source();
        while let Some(source) = cur {
            causes.push(source.to_string());
            cur = source.source();
        }
        Self {
            kind: format!("{:?}", err.kind()),
            message,
            hint: err.hint().map(str::to_string),
            path: err.path().map(|path| path.display().to_string()),
            causes,
        }
    }
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_json(err: &Error) -> Value {
    json!({ "error": ErrorReport::from_error(err) })
}

fn error_text(err: &Error, use_color: bool) -> String {
    // ANSI 31 = red, 33 = yellow.
    let label = |text: &str, code: &str| {
        if use_color {
            format!("\u{1b}[{code}m{text}\u{1b}[0m")
        } else {
            text.to_string()
        }
    };
    let report = ErrorReport::from_error(err);
    let mut out = format!("{} {}", label("error:", "31"), report.message);
    let details = [
        ("hint:", report.hint),
        ("path:", report.path),
        ("caused by:", report.causes.into_iter().next()),
    ];
    for (name, value) in details {
        if let Some(value) = value {
            out.push_str(&format!("\n{} {value}", label(name, "33")));
        }
    }
    out
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{
        BodyReadCli, Error, ErrorKind, PluginArgs, ServeArgs, add_plugin_load_hint, error_json,
        error_text, parse_config_pairs, serve_config_from_args,
    };
    use cracker_runner::api::{BodyReadMode, PluginSource};
    use std::path::PathBuf;
    use std::time::Duration;

    fn plugin_args(wasm: &str) -> PluginArgs {
        PluginArgs {
            wasm: wasm.to_string(),
            function: "handle".to_string(),
            wasi: false,
            config: Vec::new(),
            allow_host: Vec::new(),
            max_memory_bytes: None,
            timeout_ms: None,
            sha256: None,
        }
    }

    fn serve_args(plugin: PluginArgs) -> ServeArgs {
        ServeArgs {
            plugin,
            bind: "127.0.0.1:8080".to_string(),
            allow_non_loopback: false,
            body_read: BodyReadCli::Single,
            no_reload: false,
        }
    }

    #[test]
    fn error_text_respects_color_flag() {
        let err = Error::new(ErrorKind::Usage).with_message("bad input");
        let colored = error_text(&err, true);
        let plain = error_text(&err, false);
        assert!(colored.contains("\u{1b}[31merror:\u{1b}[0m"));
        assert!(plain.contains("error:"));
        assert!(!plain.contains("\u{1b}["));
    }

    #[test]
    fn error_json_carries_kind_hint_and_path() {
        let err = Error::new(ErrorKind::PluginLoad)
            .with_message("failed to read plugin module")
            .with_path("/tmp/plugin.wasm")
            .with_hint("Check the --wasm path.");
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "PluginLoad");
        assert_eq!(value["error"]["message"], "failed to read plugin module");
        assert_eq!(value["error"]["path"], "/tmp/plugin.wasm");
        assert_eq!(value["error"]["hint"], "Check the --wasm path.");
    }

    #[test]
    fn error_text_lists_hint_path_and_first_cause() {
        let err = Error::new(ErrorKind::PluginLoad)
            .with_message("failed to read plugin module")
            .with_path("/tmp/plugin.wasm")
            .with_hint("Check the --wasm path.")
            .with_source(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let text = error_text(&err, false);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "error: failed to read plugin module",
                "hint: Check the --wasm path.",
                "path: /tmp/plugin.wasm",
                "caused by: gone",
            ]
        );
        assert_eq!(error_json(&err)["error"]["causes"][0], "gone");
    }

    #[test]
    fn plugin_load_hint_is_added_only_when_missing() {
        let err = add_plugin_load_hint(Error::new(ErrorKind::PluginLoad));
        assert!(err.hint().expect("hint").contains("cracker-runner check"));

        let err = add_plugin_load_hint(Error::new(ErrorKind::PluginLoad).with_hint("keep"));
        assert_eq!(err.hint(), Some("keep"));

        let err = add_plugin_load_hint(Error::new(ErrorKind::Usage));
        assert_eq!(err.hint(), None);
    }

    #[test]
    fn config_pairs_split_on_first_equals() {
        let pairs = vec!["greeting=hello".to_string(), "expr=a=b".to_string()];
        let config = parse_config_pairs(&pairs).expect("config");
        assert_eq!(config.get("greeting").map(String::as_str), Some("hello"));
        assert_eq!(config.get("expr").map(String::as_str), Some("a=b"));

        let err = parse_config_pairs(&["novalue".to_string()]).expect_err("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = parse_config_pairs(&["=value".to_string()]).expect_err("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn serve_config_maps_flags() {
        let mut plugin = plugin_args("./plugin.wasm");
        plugin.timeout_ms = Some(250);
        plugin.function = "say_hello".to_string();
        let mut args = serve_args(plugin);
        args.body_read = BodyReadCli::Complete;
        args.no_reload = true;

        let config = serve_config_from_args(args).expect("config");
        assert_eq!(config.source, PluginSource::Path(PathBuf::from("./plugin.wasm")));
        assert_eq!(config.function, "say_hello");
        assert_eq!(config.load.function.as_deref(), Some("say_hello"));
        assert_eq!(config.load.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.body_mode, BodyReadMode::Complete);
        assert!(!config.reload_on_hangup);
    }

    #[test]
    fn serve_config_rejects_bad_values() {
        let mut args = serve_args(plugin_args("./plugin.wasm"));
        args.bind = "not-an-addr".to_string();
        assert_eq!(
            serve_config_from_args(args).expect_err("bind").kind(),
            ErrorKind::Usage
        );

        let mut plugin = plugin_args("./plugin.wasm");
        plugin.timeout_ms = Some(0);
        assert_eq!(
            serve_config_from_args(serve_args(plugin))
                .expect_err("timeout")
                .kind(),
            ErrorKind::Usage
        );

        let mut plugin = plugin_args("./plugin.wasm");
        plugin.function = String::new();
        assert_eq!(
            serve_config_from_args(serve_args(plugin))
                .expect_err("function")
                .kind(),
            ErrorKind::Usage
        );
    }
}
