#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Event,
    ExpireWaits,
    Redrive,
    Sandbox,
    Validate,
    Executions,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "event" => CliVerb::Event,
        "expire-waits" => CliVerb::ExpireWaits,
        "redrive" => CliVerb::Redrive,
        "sandbox" => CliVerb::Sandbox,
        "validate" => CliVerb::Validate,
        "executions" => CliVerb::Executions,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: allma [--config <path>] <command> ...".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  run <flow_id> [--version <n|LATEST_PUBLISHED>] [--input <json|@file>] [--no-logs]"
            .to_string(),
        "                                       Start a flow and drive it until it pauses"
            .to_string(),
        "  event <correlation_key> [--payload <json|@file>]".to_string(),
        "                                       Resume the flow waiting on a correlation key"
            .to_string(),
        "  expire-waits                         Fail waiting flows whose timeout has passed"
            .to_string(),
        "  redrive <execution_id> [--step <step_id>] [--context <json|@file>]".to_string(),
        "                                       Re-run an execution, or resume it at a step"
            .to_string(),
        "  sandbox <flow_id> <step_id> [--version <n>] [--context <json|@file>]".to_string(),
        "                                       Execute one step without side effects"
            .to_string(),
        "  validate <flow_id> [--version <n|LATEST_PUBLISHED>]".to_string(),
        "                                       Check a stored flow definition".to_string(),
        "  executions show <execution_id>       Print an execution's log records".to_string(),
        String::new(),
        "The config path may also be given through ALLMA_CONFIG.".to_string(),
    ]
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}
