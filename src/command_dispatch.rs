//! Purpose: Hold top-level CLI command dispatch for `cracker-runner`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Helpers in `main.rs` remain the source of flag validation.

use clap::CommandFactory;
use cracker_runner::api::load_plugin;

use super::*;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "cracker-runner", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Check(args) => {
            let (source, options, _function) = plugin_source_and_options(args)?;
            let loaded = load_plugin(&source, &options)?;
            let report = serde_json::to_value(&loaded.report).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode load report")
                    .with_source(err)
            })?;
            emit_json(json!({ "ok": true, "plugin": report }));
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let config = serve_config_from_args(args)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
    }
}
