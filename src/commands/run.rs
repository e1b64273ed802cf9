use clap::Args;
use serde::Serialize;

use retrofit::engine::{self, RunOptions};
use retrofit::report::RunReport;
use retrofit::rules::load_ruleset;

use super::{expand_path, CmdResult};

#[derive(Args)]
pub struct RunArgs {
    /// Ruleset file (.json, .toml, .yaml)
    #[arg(long)]
    pub rules: String,

    /// Root directory of the tree to rewrite (repeatable)
    #[arg(long, required = true)]
    pub root: Vec<String>,

    /// Only rewrite files matching this glob (repeatable)
    #[arg(long)]
    pub include: Vec<String>,

    /// Skip files matching this glob (repeatable)
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Plan and verify without writing anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Serialize)]
#[serde(tag = "command")]
pub enum RunOutput {
    #[serde(rename = "run")]
    Run {
        ruleset: String,
        #[serde(flatten)]
        report: RunReport,
    },
}

pub fn run(args: RunArgs) -> CmdResult<RunOutput> {
    let rules_path = expand_path(&args.rules);
    let loaded = load_ruleset(&rules_path)?;

    let mut include = loaded.include;
    include.extend(args.include);
    let mut exclude = loaded.exclude;
    exclude.extend(args.exclude);

    let options = RunOptions {
        roots: args.root.iter().map(|r| expand_path(r)).collect(),
        include,
        exclude,
        dry_run: args.dry_run,
        ruleset: Some(rules_path.display().to_string()),
    };

    let report = engine::run(&loaded.rules, &options)?;
    let exit_code = report.exit_code();

    Ok((
        RunOutput::Run {
            ruleset: rules_path.display().to_string(),
            report,
        },
        exit_code,
    ))
}
