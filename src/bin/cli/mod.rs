mod actions;
mod menu;
mod parse;

use std::path::PathBuf;

use anyhow::Result;

use relayctl::config::CONFIG_PATH_ENV;
use relayctl::{classify, DeployContext, ManagerConfig, SystemRunner};

use actions::{action_usage, Command, ACTIONS};

pub(crate) fn usage() -> String {
    let mut text = String::from(
        "Usage: relayctl [--config <path>] <command> [args]\n\nCommands:\n",
    );
    for action in ACTIONS {
        text.push_str(&format!("  {:<28} {}\n", action_usage(action), action.summary));
    }
    text.push_str(&format!(
        "\nConfig is read from --config, ${CONFIG_PATH_ENV}, or {}.\n",
        relayctl::config::DEFAULT_CONFIG_PATH
    ));
    text
}

pub(crate) fn run(args: &[String]) -> Result<()> {
    let invocation = parse::parse_args(args)?;
    if invocation.command == Command::Help {
        print!("{}", usage());
        return Ok(());
    }

    let config = ManagerConfig::load(
        invocation.config.as_deref(),
        std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from),
    )?;
    let runner = SystemRunner;
    let ctx = DeployContext::new(&config, &runner);

    match &invocation.command {
        Command::Menu => menu::run(&ctx),
        command => actions::execute(&ctx, command),
    }
}

pub(crate) fn print_error(err: &anyhow::Error) {
    match classify(err) {
        Some(categorized) => eprintln!("error[{}]: {:#}", categorized.category(), err),
        None => eprintln!("error: {:#}", err),
    }
}
