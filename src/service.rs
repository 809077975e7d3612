//! The bouncer command surface, addressed to the virtual service user.
//!
//! This module only parses: a command line becomes a [`ServiceCommand`]
//! or a usage error. Execution happens in the hub, which owns the state
//! the commands mutate.

use std::collections::HashMap;
use std::time::Duration;

use crate::db::MessageFilter;

/// Default name of the virtual service user.
pub const SERVICE_NICK: &str = "BouncerServ";

/// A parsed service command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCommand {
    Help,
    NetworkCreate(NetworkFlags),
    NetworkUpdate {
        name: String,
        flags: NetworkFlags,
    },
    NetworkDelete {
        name: String,
    },
    NetworkStatus,
    ChannelStatus {
        network: Option<String>,
    },
    ChannelUpdate {
        name: String,
        network: Option<String>,
        flags: ChannelFlags,
    },
    UserCreate {
        username: String,
        password: String,
        admin: bool,
    },
    UserDelete {
        username: String,
    },
    Reload,
}

/// Optional fields for `network create` / `network update`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkFlags {
    pub addr: Option<String>,
    pub name: Option<String>,
    pub nick: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub pass: Option<String>,
    pub connect_commands: Vec<String>,
    /// `none` or `plain`; EXTERNAL credentials are DER blobs and cannot
    /// be carried over a chat line.
    pub sasl: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

/// Optional fields for `channel update`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelFlags {
    pub key: Option<String>,
    pub relay_detached: Option<MessageFilter>,
    pub reattach_on: Option<MessageFilter>,
    pub detach_after: Option<Duration>,
    pub detach_on: Option<MessageFilter>,
}

/// Split a command line into words, honoring double quotes.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Split `-flag value` pairs off a word list. Positional arguments must
/// precede flags. `-connect-command` may repeat.
fn parse_flags(words: &[String]) -> Result<(Vec<String>, HashMap<String, Vec<String>>), String> {
    let mut positional = Vec::new();
    let mut flags: HashMap<String, Vec<String>> = HashMap::new();
    let mut iter = words.iter().peekable();
    while let Some(word) = iter.next() {
        if let Some(flag) = word.strip_prefix('-') {
            // Boolean flags take no value.
            if flag == "admin" {
                flags.entry(flag.to_string()).or_default().push(String::new());
                continue;
            }
            let value = iter
                .next()
                .ok_or_else(|| format!("flag -{flag} requires a value"))?;
            flags
                .entry(flag.to_string())
                .or_default()
                .push(value.clone());
        } else if flags.is_empty() {
            positional.push(word.clone());
        } else {
            return Err(format!("unexpected argument {word:?} after flags"));
        }
    }
    Ok((positional, flags))
}

fn single(flags: &mut HashMap<String, Vec<String>>, key: &str) -> Result<Option<String>, String> {
    match flags.remove(key) {
        None => Ok(None),
        Some(mut values) if values.len() == 1 => Ok(values.pop()),
        Some(_) => Err(format!("flag -{key} given more than once")),
    }
}

fn parse_filter_flag(
    flags: &mut HashMap<String, Vec<String>>,
    key: &str,
) -> Result<Option<MessageFilter>, String> {
    match single(flags, key)? {
        None => Ok(None),
        Some(value) => MessageFilter::parse(&value)
            .map(Some)
            .ok_or_else(|| format!("unknown filter {value:?} for -{key}")),
    }
}

/// Parse a duration: bare seconds, or `NNs`/`NNm`/`NNh`/`NNd`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let seconds = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        "d" => value * 60 * 60 * 24,
        _ => return Err(format!("invalid duration unit {unit:?}")),
    };
    Ok(Duration::from_secs(seconds))
}

fn network_flags(mut flags: HashMap<String, Vec<String>>) -> Result<NetworkFlags, String> {
    let parsed = NetworkFlags {
        addr: single(&mut flags, "addr")?,
        name: single(&mut flags, "name")?,
        nick: single(&mut flags, "nick")?,
        username: single(&mut flags, "username")?,
        realname: single(&mut flags, "realname")?,
        pass: single(&mut flags, "pass")?,
        connect_commands: flags.remove("connect-command").unwrap_or_default(),
        sasl: single(&mut flags, "sasl")?,
        sasl_username: single(&mut flags, "sasl-username")?,
        sasl_password: single(&mut flags, "sasl-password")?,
    };
    if let Some(mechanism) = parsed.sasl.as_deref() {
        match mechanism {
            "none" => {}
            "plain" => {
                if parsed.sasl_username.is_none() || parsed.sasl_password.is_none() {
                    return Err(
                        "-sasl plain requires -sasl-username and -sasl-password".to_string()
                    );
                }
            }
            other => return Err(format!("unsupported SASL mechanism {other:?}")),
        }
    }
    if let Some(flag) = flags.keys().next() {
        return Err(format!("unknown flag -{flag}"));
    }
    Ok(parsed)
}

/// Parse one service line.
pub fn parse(line: &str) -> Result<ServiceCommand, String> {
    let words = split_words(line);
    let Some((command, rest)) = words.split_first() else {
        return Err("empty command; try \"help\"".to_string());
    };

    match (command.as_str(), rest.split_first()) {
        ("help", _) => Ok(ServiceCommand::Help),

        ("network", Some((sub, rest))) => match sub.as_str() {
            "create" => {
                let (positional, flags) = parse_flags(rest)?;
                if !positional.is_empty() {
                    return Err("network create takes only flags".to_string());
                }
                let flags = network_flags(flags)?;
                if flags.addr.is_none() {
                    return Err("network create requires -addr".to_string());
                }
                Ok(ServiceCommand::NetworkCreate(flags))
            }
            "update" => {
                let (positional, flags) = parse_flags(rest)?;
                let [name] = positional.as_slice() else {
                    return Err("usage: network update <name> [flags]".to_string());
                };
                Ok(ServiceCommand::NetworkUpdate {
                    name: name.clone(),
                    flags: network_flags(flags)?,
                })
            }
            "delete" => {
                let [name] = rest else {
                    return Err("usage: network delete <name>".to_string());
                };
                Ok(ServiceCommand::NetworkDelete { name: name.clone() })
            }
            "status" => Ok(ServiceCommand::NetworkStatus),
            other => Err(format!("unknown subcommand: network {other}")),
        },
        ("network", None) => Err("usage: network create|update|delete|status".to_string()),

        ("channel", Some((sub, rest))) => match sub.as_str() {
            "status" => {
                let (positional, mut flags) = parse_flags(rest)?;
                if !positional.is_empty() {
                    return Err("channel status takes only flags".to_string());
                }
                let network = single(&mut flags, "network")?;
                Ok(ServiceCommand::ChannelStatus { network })
            }
            "update" => {
                let (positional, mut flags) = parse_flags(rest)?;
                let [name] = positional.as_slice() else {
                    return Err("usage: channel update <name> [flags]".to_string());
                };
                let network = single(&mut flags, "network")?;
                let detach_after = match single(&mut flags, "detach-after")? {
                    None => None,
                    Some(value) => Some(parse_duration(&value)?),
                };
                let parsed = ChannelFlags {
                    key: single(&mut flags, "key")?,
                    relay_detached: parse_filter_flag(&mut flags, "relay-detached")?,
                    reattach_on: parse_filter_flag(&mut flags, "reattach-on")?,
                    detach_after,
                    detach_on: parse_filter_flag(&mut flags, "detach-on")?,
                };
                if let Some(flag) = flags.keys().next() {
                    return Err(format!("unknown flag -{flag}"));
                }
                Ok(ServiceCommand::ChannelUpdate {
                    name: name.clone(),
                    network,
                    flags: parsed,
                })
            }
            other => Err(format!("unknown subcommand: channel {other}")),
        },
        ("channel", None) => Err("usage: channel status|update".to_string()),

        ("user", Some((sub, rest))) => match sub.as_str() {
            "create" => {
                let (positional, mut flags) = parse_flags(rest)?;
                if !positional.is_empty() {
                    return Err("user create takes only flags".to_string());
                }
                let username = single(&mut flags, "username")?
                    .ok_or_else(|| "user create requires -username".to_string())?;
                let password = single(&mut flags, "password")?
                    .ok_or_else(|| "user create requires -password".to_string())?;
                let admin = flags.remove("admin").is_some();
                if let Some(flag) = flags.keys().next() {
                    return Err(format!("unknown flag -{flag}"));
                }
                Ok(ServiceCommand::UserCreate {
                    username,
                    password,
                    admin,
                })
            }
            "delete" => {
                let [username] = rest else {
                    return Err("usage: user delete <username>".to_string());
                };
                Ok(ServiceCommand::UserDelete {
                    username: username.clone(),
                })
            }
            other => Err(format!("unknown subcommand: user {other}")),
        },
        ("user", None) => Err("usage: user create|delete".to_string()),

        ("status", _) => Ok(ServiceCommand::NetworkStatus),
        ("reload", _) => Ok(ServiceCommand::Reload),

        (other, _) => Err(format!("unknown command {other:?}; try \"help\"")),
    }
}

/// The help text, one notice per line.
pub fn help_text() -> Vec<String> {
    vec![
        "network create -addr <addr> [-name name] [-nick nick] [-username user] \
         [-realname name] [-pass pass] [-connect-command cmd]... \
         [-sasl none|plain -sasl-username u -sasl-password p]"
            .to_string(),
        "network update <name> [same flags as create]".to_string(),
        "network delete <name>".to_string(),
        "network status".to_string(),
        "channel status [-network name]".to_string(),
        "channel update <name> [-network name] [-key key] [-relay-detached filter] \
         [-reattach-on filter] [-detach-after duration] [-detach-on filter]"
            .to_string(),
        "user create -username <name> -password <pass> [-admin]  (admin only)".to_string(),
        "user delete <username>  (admin only)".to_string(),
        "reload  (admin only)".to_string(),
        "filters are: default, none, highlight, message".to_string(),
    ]
}
