use clap::Args;
use serde::Serialize;

use retrofit::rules::{load_ruleset, RuleSpec};

use super::{expand_path, CmdResult};

#[derive(Args)]
pub struct RulesArgs {
    /// Ruleset file (.json, .toml, .yaml)
    #[arg(long)]
    pub rules: String,
}

#[derive(Serialize)]
#[serde(tag = "command")]
pub enum RulesOutput {
    /// Rules in the order a run evaluates them.
    #[serde(rename = "rules")]
    Rules {
        ruleset: String,
        include: Vec<String>,
        exclude: Vec<String>,
        rules: Vec<RuleSpec>,
    },
}

pub fn run(args: RulesArgs) -> CmdResult<RulesOutput> {
    let path = expand_path(&args.rules);
    let loaded = load_ruleset(&path)?;
    let rules = loaded.rules.ordered().into_iter().cloned().collect();

    Ok((
        RulesOutput::Rules {
            ruleset: path.display().to_string(),
            include: loaded.include,
            exclude: loaded.exclude,
            rules,
        },
        0,
    ))
}
