//! The command table shared by the argument parser and the interactive menu.

use anyhow::{bail, Context, Result};

use relayctl::build::BuildSelection;
use relayctl::cert::{issue_certificate, CertRequest};
use relayctl::control::{config_location, editor_from_env, ControlSurface};
use relayctl::install::InstallMetadata;
use relayctl::lifecycle;
use relayctl::{DeployContext, DeployError, Warning};

const DEFAULT_LOG_LINES: usize = 50;

/// One argument an action takes, used for usage text and menu prompts.
pub(crate) struct Param {
    pub(crate) name: &'static str,
    pub(crate) optional: bool,
}

const fn required(name: &'static str) -> Param {
    Param {
        name,
        optional: false,
    }
}

const fn optional(name: &'static str) -> Param {
    Param {
        name,
        optional: true,
    }
}

pub(crate) struct Action {
    pub(crate) name: &'static str,
    pub(crate) summary: &'static str,
    pub(crate) params: &'static [Param],
}

pub(crate) const ACTIONS: &[Action] = &[
    Action {
        name: "install",
        summary: "build and install (full|udpgw-only|tun2socks-only|custom:FLAGS)",
        params: &[optional("selection")],
    },
    Action {
        name: "uninstall",
        summary: "remove everything recorded in the install manifest",
        params: &[],
    },
    Action {
        name: "status",
        summary: "show service state",
        params: &[],
    },
    Action {
        name: "logs",
        summary: "show recent service logs",
        params: &[optional("lines")],
    },
    Action {
        name: "logs-f",
        summary: "follow service logs (Ctrl-C to stop)",
        params: &[],
    },
    Action {
        name: "ports",
        summary: "list sockets the gateway listens on",
        params: &[],
    },
    Action {
        name: "start",
        summary: "start the service",
        params: &[],
    },
    Action {
        name: "stop",
        summary: "stop the service",
        params: &[],
    },
    Action {
        name: "restart",
        summary: "restart the service",
        params: &[],
    },
    Action {
        name: "edit",
        summary: "edit the runtime config, then restart",
        params: &[],
    },
    Action {
        name: "set-addr",
        summary: "change LISTEN_ADDR, then restart",
        params: &[required("host:port")],
    },
    Action {
        name: "set",
        summary: "change one runtime config field, then restart",
        params: &[required("field"), required("value")],
    },
    Action {
        name: "ssl",
        summary: "issue a panel certificate (--force to re-issue)",
        params: &[required("domain"), optional("--force")],
    },
    Action {
        name: "global",
        summary: "install the relayctl command system-wide",
        params: &[],
    },
    Action {
        name: "menu",
        summary: "interactive menu",
        params: &[],
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Install { selection: Option<String> },
    Uninstall,
    Status,
    Logs { lines: usize },
    LogsFollow,
    Ports,
    Start,
    Stop,
    Restart,
    Edit,
    SetAddr(String),
    Set { field: String, value: String },
    Ssl { domain: String, force: bool },
    Global,
    Menu,
    Help,
}

impl Command {
    /// Build a command from a table name and its positional arguments.
    pub(crate) fn from_parts(name: &str, args: &[String]) -> Result<Self> {
        let action = ACTIONS
            .iter()
            .find(|a| a.name == name)
            .with_context(|| format!("unknown command '{name}'\n\n{}", super::usage()))?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let command = match (action.name, args.as_slice()) {
            ("install", []) => Self::Install { selection: None },
            ("install", [selection]) => Self::Install {
                selection: Some(selection.to_string()),
            },
            ("uninstall", []) => Self::Uninstall,
            ("status", []) => Self::Status,
            ("logs", []) => Self::Logs {
                lines: DEFAULT_LOG_LINES,
            },
            ("logs", [n]) => Self::Logs {
                lines: parse_lines(n)?,
            },
            ("logs-f", []) => Self::LogsFollow,
            ("ports", []) => Self::Ports,
            ("start", []) => Self::Start,
            ("stop", []) => Self::Stop,
            ("restart", []) => Self::Restart,
            ("edit", []) => Self::Edit,
            ("set-addr", [addr]) => Self::SetAddr(addr.to_string()),
            ("set", [field, value]) => Self::Set {
                field: field.to_string(),
                value: value.to_string(),
            },
            ("ssl", [domain]) => Self::Ssl {
                domain: domain.to_string(),
                force: false,
            },
            ("ssl", [domain, "--force"]) | ("ssl", ["--force", domain]) => Self::Ssl {
                domain: domain.to_string(),
                force: true,
            },
            ("global", []) => Self::Global,
            ("menu", []) => Self::Menu,
            _ => bail!("usage: relayctl {}", action_usage(action)),
        };
        Ok(command)
    }
}

fn parse_lines(raw: &str) -> Result<usize> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(DeployError::InvalidInput {
            what: "line count".to_string(),
            reason: format!("'{raw}' is not a positive integer"),
        }
        .into()),
    }
}

pub(crate) fn action_usage(action: &Action) -> String {
    let mut usage = action.name.to_string();
    for param in action.params {
        if param.optional {
            usage.push_str(&format!(" [{}]", param.name));
        } else {
            usage.push_str(&format!(" <{}>", param.name));
        }
    }
    usage
}

/// Run `command` against the host. Help and the menu are handled by the caller.
pub(crate) fn execute(ctx: &DeployContext<'_>, command: &Command) -> Result<()> {
    let control = ControlSurface::new(ctx);
    match command {
        Command::Install { selection } => {
            let raw = selection
                .as_deref()
                .unwrap_or(ctx.config.build.selection.as_str());
            let selection = BuildSelection::parse(raw)?;
            let report = lifecycle::install(ctx, &selection)?;
            println!(
                "Installed {} from {} ({})",
                report.selection,
                report.source.git_ref,
                short_commit(&report.source.commit)
            );
            for binary in &report.binaries {
                println!("  {:<10} {}", binary.component.name(), binary.path.display());
            }
            if let Some(unit) = &report.unit {
                println!("  unit       {}", unit.display());
            }
            match &report.config_created {
                Some(path) => println!("  config     {} (created)", path.display()),
                None if report.unit.is_some() => {
                    println!("  config     {} (kept)", config_location(ctx).display())
                }
                None => {}
            }
            print_warnings(&report.warnings);
        }
        Command::Uninstall => {
            let report = lifecycle::uninstall(ctx)?;
            println!("Removed {} path(s)", report.removal.removed.len());
            for path in &report.removal.removed {
                println!("  {}", path.display());
            }
            print_warnings(&report.warnings);
        }
        Command::Status => {
            let status = control.status()?;
            println!("{}: {}", ctx.service_name(), status.state);
            if let Some(meta) = InstallMetadata::load(&ctx.paths().metadata_path())? {
                println!(
                    "installed {} ({} @ {}) at {}",
                    meta.selection,
                    meta.git_ref,
                    short_commit(&meta.commit),
                    meta.installed_at
                );
            }
            let detail = status.detail.trim();
            if !detail.is_empty() {
                println!();
                println!("{detail}");
            }
        }
        Command::Logs { lines } => print!("{}", control.tail_logs(*lines)?),
        Command::LogsFollow => control.follow_logs()?,
        Command::Ports => {
            let sockets = control.ports()?;
            if sockets.is_empty() {
                println!("No listening sockets for the gateway");
            }
            for socket in sockets {
                println!("{socket}");
            }
        }
        Command::Start => {
            control.start()?;
            println!("{} started", ctx.service_name());
        }
        Command::Stop => {
            control.stop()?;
            println!("{} stopped", ctx.service_name());
        }
        Command::Restart => {
            control.restart()?;
            println!("{} restarted", ctx.service_name());
        }
        Command::Edit => {
            let Some(editor) = editor_from_env(ctx.runner) else {
                bail!("no editor found; set $VISUAL or $EDITOR");
            };
            let change = control.edit_config(&editor)?;
            println!("Saved {}", change.path.display());
            print_warnings(&change.warnings);
        }
        Command::SetAddr(addr) => {
            let change = control.set_listen_addr(addr)?;
            report_change(&change.field, &change.warnings);
        }
        Command::Set { field, value } => {
            let change = control.set_field(field, value)?;
            report_change(&change.field, &change.warnings);
        }
        Command::Ssl { domain, force } => {
            let issued = issue_certificate(
                ctx,
                &CertRequest {
                    domain: domain.clone(),
                    force: *force,
                },
            )?;
            println!("Certificate issued for {}", issued.record.domain);
            println!("  certificate {}", issued.record.certificate.display());
            println!("  key         {}", issued.record.private_key.display());
            if let Some(url) = &issued.access_url {
                println!("  panel       {url}");
            }
            print_warnings(&issued.warnings);
        }
        Command::Global => {
            let exe = std::env::current_exe().context("locating the running executable")?;
            let link = lifecycle::install_global(ctx, &exe)?;
            println!("{} -> {}", link.display(), exe.display());
        }
        Command::Menu | Command::Help => {}
    }
    Ok(())
}

fn report_change(field: &Option<(relayctl::service::Field, String)>, warnings: &[Warning]) {
    if let Some((field, value)) = field {
        println!("{field}={value}");
    }
    print_warnings(warnings);
}

fn print_warnings(warnings: &[Warning]) {
    if warnings.is_empty() {
        return;
    }
    println!("Completed with {} warning(s):", warnings.len());
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn short_commit(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_action_parses_with_its_required_params() {
        for action in ACTIONS {
            let args: Vec<String> = action
                .params
                .iter()
                .filter(|p| !p.optional)
                .map(|p| match p.name {
                    "host:port" => "0.0.0.0:9000".to_string(),
                    "domain" => "panel.example.com".to_string(),
                    "field" => "MAX_CLIENTS".to_string(),
                    _ => "1".to_string(),
                })
                .collect();
            assert!(
                Command::from_parts(action.name, &args).is_ok(),
                "{} should parse",
                action.name
            );
        }
    }

    #[test]
    fn test_bad_line_count_is_invalid_input() {
        let err = Command::from_parts("logs", &["zero".to_string()]).unwrap_err();
        assert_eq!(
            relayctl::classify(&err).map(|e| e.category()),
            Some("invalid-input")
        );
    }

    #[test]
    fn test_usage_marks_optional_params() {
        let ssl = ACTIONS.iter().find(|a| a.name == "ssl").unwrap();
        assert_eq!(action_usage(ssl), "ssl <domain> [--force]");
    }
}
