use std::path::PathBuf;

use anyhow::{bail, Result};

use super::actions::Command;

/// Parsed command line: global options plus the command.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub(crate) config: Option<PathBuf>,
    pub(crate) command: Command,
}

pub(crate) fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config = None;
    let mut rest: Vec<String> = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => match iter.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("--config requires a path"),
            },
            other => match other.strip_prefix("--config=") {
                Some(path) if !path.is_empty() => config = Some(PathBuf::from(path)),
                Some(_) => bail!("--config requires a path"),
                None => rest.push(arg.clone()),
            },
        }
    }

    let command = match rest.as_slice() {
        [] => Command::Help,
        [help] if help == "help" || help == "--help" || help == "-h" => Command::Help,
        [name, args @ ..] => Command::from_parts(name, args)?,
    };
    Ok(Invocation { config, command })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_flag_anywhere() {
        let inv = parse_args(&strings(&["status", "--config", "/tmp/r.toml"])).unwrap();
        assert_eq!(inv.config, Some(PathBuf::from("/tmp/r.toml")));
        assert_eq!(inv.command, Command::Status);

        let inv = parse_args(&strings(&["--config=/etc/x.toml", "ports"])).unwrap();
        assert_eq!(inv.config, Some(PathBuf::from("/etc/x.toml")));
        assert_eq!(inv.command, Command::Ports);
    }

    #[test]
    fn test_no_args_is_help() {
        assert_eq!(parse_args(&[]).unwrap().command, Command::Help);
    }

    #[test]
    fn test_dangling_config_flag() {
        assert!(parse_args(&strings(&["--config"])).is_err());
    }

    #[test]
    fn test_subcommands_with_arguments() {
        assert_eq!(
            parse_args(&strings(&["set", "max_clients", "64"])).unwrap().command,
            Command::Set {
                field: "max_clients".into(),
                value: "64".into()
            }
        );
        assert_eq!(
            parse_args(&strings(&["ssl", "panel.example.com", "--force"]))
                .unwrap()
                .command,
            Command::Ssl {
                domain: "panel.example.com".into(),
                force: true
            }
        );
        assert_eq!(
            parse_args(&strings(&["logs", "200"])).unwrap().command,
            Command::Logs { lines: 200 }
        );
        assert_eq!(
            parse_args(&strings(&["install", "udpgw-only"])).unwrap().command,
            Command::Install {
                selection: Some("udpgw-only".into())
            }
        );
        assert!(parse_args(&strings(&["set-addr"])).is_err());
        assert!(parse_args(&strings(&["frobnicate"])).is_err());
    }
}
