use crate::app::cli::{help_text, parse_cli_verb, CliVerb};
use crate::app::command_support::split_config_flag;

pub mod executions;
pub mod flows;
pub mod redrive;
pub mod sandbox;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let (config_path, args) = split_config_flag(args)?;
    if args.is_empty() {
        return Ok(help_text());
    }
    let config = config_path.as_deref();

    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Run => flows::cmd_run(config, &args[1..]),
        CliVerb::Event => flows::cmd_event(config, &args[1..]),
        CliVerb::ExpireWaits => flows::cmd_expire_waits(config, &args[1..]),
        CliVerb::Validate => flows::cmd_validate(config, &args[1..]),
        CliVerb::Redrive => redrive::cmd_redrive(config, &args[1..]),
        CliVerb::Sandbox => sandbox::cmd_sandbox(config, &args[1..]),
        CliVerb::Executions => executions::cmd_executions(config, &args[1..]),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`", args[0])),
    }
}
