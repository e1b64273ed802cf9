use std::path::PathBuf;

pub type CmdResult<T> = retrofit::Result<(T, i32)>;

pub mod report;
pub mod rules;
pub mod run;

/// Expand `~` in a path given on the command line.
pub(crate) fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args))
    };
}

pub(crate) fn run_json(command: crate::Commands) -> (retrofit::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Run(args) => dispatch!(args, run),
        crate::Commands::Report(args) => dispatch!(args, report),
        crate::Commands::Rules(args) => dispatch!(args, rules),
    }
}

pub(crate) fn run_text(command: crate::Commands) -> retrofit::Result<(String, i32)> {
    match command {
        crate::Commands::Report(args) => report::run_text(args),
        _ => Err(retrofit::Error::validation_invalid_argument(
            "format",
            "Command does not support text output",
        )),
    }
}
