//! Interactive menu over the same action table the CLI uses.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

use relayctl::DeployContext;

use super::actions::{execute, Command, ACTIONS};

/// Loop until the operator quits or stdin closes.
pub(crate) fn run(ctx: &DeployContext<'_>) -> Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    loop {
        let Some(command) = choose(&mut input, &mut output)? else {
            return Ok(());
        };
        if let Err(err) = execute(ctx, &command) {
            super::print_error(&err);
        }
        writeln!(output)?;
    }
}

/// Show the menu and read one choice, prompting for its parameters.
///
/// `None` means quit. A bad choice or bad arguments re-prompt.
pub(crate) fn choose(input: &mut impl BufRead, output: &mut impl Write) -> Result<Option<Command>> {
    let entries: Vec<_> = ACTIONS.iter().filter(|a| a.name != "menu").collect();
    loop {
        writeln!(output, "relayctl")?;
        for (i, action) in entries.iter().enumerate() {
            writeln!(output, "  {:>2}) {:<10} {}", i + 1, action.name, action.summary)?;
        }
        writeln!(output, "   0) quit")?;

        let Some(choice) = prompt(input, output, "choice")? else {
            return Ok(None);
        };
        if choice == "0" || choice.eq_ignore_ascii_case("q") {
            return Ok(None);
        }
        let action = match choice.parse::<usize>() {
            Ok(n) if (1..=entries.len()).contains(&n) => entries[n - 1],
            _ => match entries.iter().find(|a| a.name == choice) {
                Some(action) => *action,
                None => {
                    writeln!(output, "unknown choice '{choice}'")?;
                    continue;
                }
            },
        };

        let mut args = Vec::new();
        for param in action.params {
            if param.name.starts_with("--") {
                let label = format!("{} [y/N]", param.name);
                let enabled = loop {
                    let Some(answer) = prompt(input, output, &label)? else {
                        return Ok(None);
                    };
                    match flag_answer(&answer, param.name) {
                        Some(enabled) => break enabled,
                        None => writeln!(output, "answer y or n")?,
                    }
                };
                if enabled {
                    args.push(param.name.to_string());
                }
                continue;
            }

            let label = if param.optional {
                format!("{} (optional)", param.name)
            } else {
                param.name.to_string()
            };
            let Some(value) = prompt(input, output, &label)? else {
                return Ok(None);
            };
            if value.is_empty() && param.optional {
                continue;
            }
            args.push(value);
        }

        match Command::from_parts(action.name, &args) {
            Ok(command) => return Ok(Some(command)),
            Err(err) => writeln!(output, "{err:#}")?,
        }
    }
}

/// Yes/no for a flag parameter; the flag itself also counts as yes.
fn flag_answer(answer: &str, flag: &str) -> Option<bool> {
    match answer.to_ascii_lowercase().as_str() {
        "" | "n" | "no" => Some(false),
        "y" | "yes" => Some(true),
        other if other == flag => Some(true),
        _ => None,
    }
}

fn prompt(input: &mut impl BufRead, output: &mut impl Write, label: &str) -> Result<Option<String>> {
    write!(output, "{label}> ")?;
    output.flush()?;
    let mut line = String::new();
    let read = input.read_line(&mut line).context("reading menu input")?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choose_from(script: &str) -> Option<Command> {
        let mut input = script.as_bytes();
        let mut output = Vec::new();
        choose(&mut input, &mut output).unwrap()
    }

    #[test]
    fn test_numbered_choice_prompts_for_params() {
        let set_addr = ACTIONS.iter().position(|a| a.name == "set-addr").unwrap() + 1;
        let script = format!("{set_addr}\n0.0.0.0:9000\n");
        assert_eq!(
            choose_from(&script),
            Some(Command::SetAddr("0.0.0.0:9000".into()))
        );
    }

    #[test]
    fn test_optional_param_can_be_skipped() {
        assert_eq!(
            choose_from("ssl\npanel.example.com\n\n"),
            Some(Command::Ssl {
                domain: "panel.example.com".into(),
                force: false
            })
        );
    }

    #[test]
    fn test_flag_param_takes_yes_or_no() {
        let forced = Some(Command::Ssl {
            domain: "panel.example.com".into(),
            force: true,
        });
        assert_eq!(choose_from("ssl\npanel.example.com\ny\n"), forced);
        assert_eq!(choose_from("ssl\npanel.example.com\nYES\n"), forced);
        assert_eq!(choose_from("ssl\npanel.example.com\n--force\n"), forced);
        assert_eq!(
            choose_from("ssl\npanel.example.com\nmaybe\nno\n"),
            Some(Command::Ssl {
                domain: "panel.example.com".into(),
                force: false
            })
        );
    }

    #[test]
    fn test_unknown_choice_reprompts_then_quits() {
        assert_eq!(choose_from("99\nq\n"), None);
        assert_eq!(choose_from(""), None);
    }

    #[test]
    fn test_menu_is_not_offered_inside_itself() {
        let mut input = "0\n".as_bytes();
        let mut output = Vec::new();
        choose(&mut input, &mut output).unwrap();
        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains("set-addr"));
        assert!(!shown.contains("interactive menu"));
    }
}
