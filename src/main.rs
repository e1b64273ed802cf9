use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{report, rules, run};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy)]
enum ResponseMode {
    Json,
    Text,
}

#[derive(Parser)]
#[command(name = "retrofit")]
#[command(version = VERSION)]
#[command(about = "Declarative, idempotent bulk source rewriting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a ruleset to a source tree
    Run(run::RunArgs),
    /// Show the last run's report and any drift since
    Report(report::ReportArgs),
    /// Validate a ruleset and list its rules in evaluation order
    Rules(rules::RulesArgs),
}

fn response_mode(command: &Commands) -> ResponseMode {
    match command {
        Commands::Report(args) if args.format == report::ReportFormat::Text => ResponseMode::Text,
        _ => ResponseMode::Json,
    }
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    match response_mode(&cli.command) {
        ResponseMode::Text => match commands::run_text(cli.command) {
            Ok((content, exit_code)) => {
                print!("{}", content);
                std::process::ExitCode::from(exit_code_to_u8(exit_code))
            }
            Err(err) => {
                let exit_code = output::exit_code_for_error(err.code);
                let _ = output::print_result::<serde_json::Value>(Err(err));
                std::process::ExitCode::from(exit_code_to_u8(exit_code))
            }
        },
        ResponseMode::Json => {
            let (json_result, exit_code) = commands::run_json(cli.command);
            let _ = output::print_json_result(json_result);
            std::process::ExitCode::from(exit_code_to_u8(exit_code))
        }
    }
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
