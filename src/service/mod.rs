//! Runtime configuration of the UDP gateway and its supervisor unit.
//!
//! The configuration is a `KEY=VALUE` environment file referenced by the unit
//! through `EnvironmentFile=`, so operator edits survive unit regeneration.
//! The installer creates it once; after that only the operator changes it.

pub mod unit;

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::ServiceDefaults;
use crate::error::DeployError;
use crate::manifest::{temp_sibling, write_atomic};

/// Fields of the runtime configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    ListenAddr,
    MaxClients,
    MaxConnectionsForClient,
}

impl Field {
    pub const ALL: [Field; 3] = [
        Self::ListenAddr,
        Self::MaxClients,
        Self::MaxConnectionsForClient,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::ListenAddr => "LISTEN_ADDR",
            Self::MaxClients => "MAX_CLIENTS",
            Self::MaxConnectionsForClient => "MAX_CONNECTIONS_FOR_CLIENT",
        }
    }

    /// Look a field up by key, case-insensitively.
    pub fn from_key(key: &str) -> Result<Self> {
        let key = key.trim();
        Self::ALL
            .into_iter()
            .find(|field| field.key().eq_ignore_ascii_case(key))
            .ok_or_else(|| {
                let known = Self::ALL.map(Field::key).join(", ");
                DeployError::invalid("config field", format!("'{key}' (expected one of {known})"))
                    .into()
            })
    }

    /// Validate and normalize a value for this field.
    pub fn validate(self, value: &str) -> Result<String> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DeployError::invalid(self.key(), "value must not be empty").into());
        }
        match self {
            Self::ListenAddr => {
                let addr: SocketAddr = value.parse().map_err(|_| {
                    DeployError::invalid(self.key(), format!("'{value}' is not a host:port address"))
                })?;
                if addr.port() == 0 {
                    return Err(DeployError::invalid(self.key(), "port must not be 0").into());
                }
                Ok(addr.to_string())
            }
            Self::MaxClients | Self::MaxConnectionsForClient => {
                let n: u32 = value.parse().map_err(|_| {
                    DeployError::invalid(self.key(), format!("'{value}' is not a positive integer"))
                })?;
                if n == 0 {
                    return Err(
                        DeployError::invalid(self.key(), "must be a positive integer").into(),
                    );
                }
                Ok(n.to_string())
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub listen_addr: String,
    pub max_clients: u32,
    pub max_connections_per_client: u32,
}

impl ServiceConfig {
    pub fn from_defaults(defaults: &ServiceDefaults) -> Result<Self> {
        Ok(Self {
            listen_addr: Field::ListenAddr.validate(&defaults.listen_addr)?,
            max_clients: parse_positive(Field::MaxClients, &defaults.max_clients.to_string())?,
            max_connections_per_client: parse_positive(
                Field::MaxConnectionsForClient,
                &defaults.max_connections_per_client.to_string(),
            )?,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "# badvpn-udpgw runtime configuration, read by the service unit.\n\
             # Edit with `relayctl edit` or `relayctl set <FIELD> <VALUE>`.\n\
             {}={}\n{}={}\n{}={}\n",
            Field::ListenAddr.key(),
            self.listen_addr,
            Field::MaxClients.key(),
            self.max_clients,
            Field::MaxConnectionsForClient.key(),
            self.max_connections_per_client,
        )
    }

    /// Parse an environment file. Comments and unknown keys are ignored;
    /// every known field must be present and valid.
    pub fn parse(text: &str) -> Result<Self> {
        let lookup = |field: Field| -> Result<String> {
            // Later assignments win, as with systemd's EnvironmentFile=.
            let raw = env_lines(text)
                .filter(|(key, _)| *key == field.key())
                .last()
                .map(|(_, value)| value)
                .ok_or_else(|| DeployError::invalid(field.key(), "missing from configuration"))?;
            field.validate(raw)
        };
        Ok(Self {
            listen_addr: lookup(Field::ListenAddr)?,
            max_clients: parse_positive(Field::MaxClients, &lookup(Field::MaxClients)?)?,
            max_connections_per_client: parse_positive(
                Field::MaxConnectionsForClient,
                &lookup(Field::MaxConnectionsForClient)?,
            )?,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading service config '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing service config '{}'", path.display()))
    }
}

fn parse_positive(field: Field, raw: &str) -> Result<u32> {
    let normalized = field.validate(raw)?;
    normalized
        .parse()
        .with_context(|| format!("{} is not a number", field.key()))
}

/// `(key, value)` pairs of assignment lines, quotes stripped.
fn env_lines(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (key, value) = line.split_once('=')?;
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        Some((key.trim(), value))
    })
}

/// Set `field` to `value` in `text`, or append an assignment.
///
/// The last assignment is the effective one and is rewritten in place;
/// earlier duplicates are dropped. Every other line, including comments and
/// unknown keys, is kept verbatim.
pub fn set_field_in_text(text: &str, field: Field, value: &str) -> String {
    let assigns = |line: &str| {
        line.trim_start()
            .split_once('=')
            .map(|(key, _)| key.trim() == field.key())
            .unwrap_or(false)
    };
    let effective = text
        .lines()
        .enumerate()
        .filter(|(_, line)| assigns(line))
        .map(|(i, _)| i)
        .last();

    let mut out = String::with_capacity(text.len() + 32);
    for (i, line) in text.lines().enumerate() {
        if Some(i) == effective {
            out.push_str(&format!("{}={}", field.key(), value));
        } else if assigns(line) {
            continue;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    if effective.is_none() {
        out.push_str(&format!("{}={}\n", field.key(), value));
    }
    out
}

/// Validate `value` and rewrite exactly that field in the file at `path`.
/// Returns the normalized value that was written.
pub fn set_field_in_file(path: &Path, field: Field, value: &str) -> Result<String> {
    let value = field.validate(value)?;
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading service config '{}'", path.display()))?;
    let updated = set_field_in_text(&text, field, &value);
    write_atomic(path, updated.as_bytes())
        .with_context(|| format!("updating {} in '{}'", field.key(), path.display()))?;
    Ok(value)
}

/// Write `config` to `path` unless a file already exists there.
///
/// Returns `true` when the file was created by this call. The content is
/// staged in a temp file and hard-linked into place, so a concurrent writer or
/// an operator file that appears in between is never clobbered.
pub fn write_config_if_absent(path: &Path, config: &ServiceConfig) -> Result<bool> {
    if fs::symlink_metadata(path).is_ok() {
        return Ok(false);
    }
    let tmp = temp_sibling(path)?;
    let staged = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("creating '{}'", tmp.display()))?;
        file.write_all(config.render().as_bytes())
            .with_context(|| format!("writing '{}'", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing '{}'", tmp.display()))
    })();
    let linked = staged.and_then(|()| match fs::hard_link(&tmp, path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("creating '{}'", path.display())),
    });
    let _ = fs::remove_file(&tmp);
    linked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use tempfile::TempDir;

    #[test]
    fn config_is_created_once_and_never_overwritten() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("etc/udpgw.env");
        let defaults = ServiceConfig::from_defaults(&ServiceDefaults::default()).unwrap();

        assert!(write_config_if_absent(&path, &defaults).unwrap());
        fs::write(&path, "LISTEN_ADDR=0.0.0.0:9000\n# mine\n").unwrap();

        assert!(!write_config_if_absent(&path, &defaults).unwrap());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "LISTEN_ADDR=0.0.0.0:9000\n# mine\n"
        );
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn defaults_render_and_parse_back() {
        let config = ServiceConfig::from_defaults(&ServiceDefaults::default()).unwrap();
        let text = config.render();
        assert!(text.contains("LISTEN_ADDR=127.0.0.1:7300\n"));
        assert_eq!(ServiceConfig::parse(&text).unwrap(), config);
    }

    #[test]
    fn field_lookup_is_case_insensitive() {
        assert_eq!(Field::from_key("listen_addr").unwrap(), Field::ListenAddr);
        assert!(Field::from_key("PORT").is_err());
    }

    #[test]
    fn empty_values_are_invalid_input() {
        let err = Field::MaxClients.validate("  ").unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(DeployError::InvalidInput { .. })
        ));
    }

    #[test]
    fn values_are_type_checked() {
        assert_eq!(Field::ListenAddr.validate("0.0.0.0:9000").unwrap(), "0.0.0.0:9000");
        assert_eq!(Field::ListenAddr.validate("[::]:7300").unwrap(), "[::]:7300");
        assert!(Field::ListenAddr.validate("localhost").is_err());
        assert!(Field::ListenAddr.validate("0.0.0.0:0").is_err());
        assert!(Field::MaxClients.validate("0").is_err());
        assert!(Field::MaxClients.validate("-4").is_err());
        assert_eq!(Field::MaxConnectionsForClient.validate("32").unwrap(), "32");
    }

    #[test]
    fn set_field_rewrites_exactly_one_line() {
        let text = "# operator notes\nLISTEN_ADDR=127.0.0.1:7300\nMAX_CLIENTS=1000\nEXTRA=keep\n";
        let updated = set_field_in_text(text, Field::ListenAddr, "0.0.0.0:9000");
        assert_eq!(
            updated,
            "# operator notes\nLISTEN_ADDR=0.0.0.0:9000\nMAX_CLIENTS=1000\nEXTRA=keep\n"
        );
    }

    #[test]
    fn duplicate_keys_resolve_to_the_last_assignment() {
        let text = "LISTEN_ADDR=127.0.0.1:7300\nMAX_CLIENTS=1000\nMAX_CONNECTIONS_FOR_CLIENT=10\n\
                    # added later\nLISTEN_ADDR=127.0.0.1:7400\n";
        assert_eq!(ServiceConfig::parse(text).unwrap().listen_addr, "127.0.0.1:7400");

        let updated = set_field_in_text(text, Field::ListenAddr, "0.0.0.0:9000");
        assert_eq!(
            updated,
            "MAX_CLIENTS=1000\nMAX_CONNECTIONS_FOR_CLIENT=10\n# added later\nLISTEN_ADDR=0.0.0.0:9000\n"
        );
        assert_eq!(ServiceConfig::parse(&updated).unwrap().listen_addr, "0.0.0.0:9000");
    }

    #[test]
    fn set_field_appends_when_absent() {
        let updated = set_field_in_text("MAX_CLIENTS=5\n", Field::ListenAddr, "0.0.0.0:9000");
        assert_eq!(updated, "MAX_CLIENTS=5\nLISTEN_ADDR=0.0.0.0:9000\n");
    }

    #[test]
    fn set_field_in_file_persists_normalized_value() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("udpgw.env");
        let config = ServiceConfig::from_defaults(&ServiceDefaults::default()).unwrap();
        fs::write(&path, config.render()).unwrap();

        let written = set_field_in_file(&path, Field::MaxClients, " 250 ").unwrap();
        assert_eq!(written, "250");
        assert_eq!(ServiceConfig::load(&path).unwrap().max_clients, 250);
    }

    #[test]
    fn rejected_value_leaves_file_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("udpgw.env");
        fs::write(&path, "LISTEN_ADDR=127.0.0.1:7300\n").unwrap();

        assert!(set_field_in_file(&path, Field::ListenAddr, "").is_err());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "LISTEN_ADDR=127.0.0.1:7300\n"
        );
    }
}
