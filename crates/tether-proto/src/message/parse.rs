//! Message parsing: `FromStr` for [`Message`].

use std::str::FromStr;

use crate::error::{MessageParseError, ProtocolError};

use super::tags::unescape_tag_value;
use super::types::{Message, Source, Tag};

fn parse_tags(section: &str) -> Result<Vec<Tag>, MessageParseError> {
    let mut tags = Vec::new();
    for item in section.split(';') {
        if item.is_empty() {
            continue;
        }
        let (key, value) = match item.split_once('=') {
            Some((key, value)) => (key, Some(unescape_tag_value(value))),
            None => (item, None),
        };
        if key.is_empty() {
            return Err(MessageParseError::EmptyTagKey);
        }
        tags.push(Tag {
            key: key.to_string(),
            value,
        });
    }
    Ok(tags)
}

fn parse_inner(line: &str) -> Result<Message, MessageParseError> {
    let mut rest = line.trim_end_matches(['\r', '\n']);
    if rest.is_empty() {
        return Err(MessageParseError::EmptyMessage);
    }

    let mut tags = Vec::new();
    if let Some(after) = rest.strip_prefix('@') {
        let (section, remainder) = after
            .split_once(' ')
            .ok_or(MessageParseError::MissingCommand)?;
        tags = parse_tags(section)?;
        rest = remainder.trim_start_matches(' ');
    }

    let mut source = None;
    if let Some(after) = rest.strip_prefix(':') {
        let (prefix, remainder) = after
            .split_once(' ')
            .ok_or(MessageParseError::MissingCommand)?;
        source = Some(Source::parse(prefix));
        rest = remainder.trim_start_matches(' ');
    }

    let (command, mut rest) = match rest.split_once(' ') {
        Some((cmd, remainder)) => (cmd, remainder),
        None => (rest, ""),
    };
    Message::validate_command(command)?;

    let mut params = Vec::new();
    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }
        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing.to_string());
            break;
        }
        match rest.split_once(' ') {
            Some((param, remainder)) => {
                params.push(param.to_string());
                rest = remainder;
            }
            None => {
                params.push(rest.to_string());
                break;
            }
        }
    }

    Ok(Message {
        tags,
        source,
        command: command.to_ascii_uppercase(),
        params,
    })
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, Self::Err> {
        parse_inner(s).map_err(|cause| ProtocolError::InvalidMessage {
            string: s.to_string(),
            cause,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let msg: Message = "PING :token\r\n".parse().unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["token"]);
    }

    #[test]
    fn parse_privmsg_with_source() {
        let msg: Message = ":nick!user@host PRIVMSG #chan :Hello, world!".parse().unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.source_name(), Some("nick"));
        assert_eq!(msg.params, vec!["#chan", "Hello, world!"]);
    }

    #[test]
    fn parse_tags_and_values() {
        let msg: Message = "@time=2024-01-01T00:00:00.000Z;msgid=abc :n PRIVMSG #c :hi"
            .parse()
            .unwrap();
        assert_eq!(msg.tag_value("time"), Some("2024-01-01T00:00:00.000Z"));
        assert_eq!(msg.tag_value("msgid"), Some("abc"));
    }

    #[test]
    fn parse_escaped_tag_value() {
        let msg: Message = "@k=a\\sb PING :x".parse().unwrap();
        assert_eq!(msg.tag_value("k"), Some("a b"));
    }

    #[test]
    fn parse_tag_empty_value_vs_flag() {
        let msg: Message = "@a=;b PING :x".parse().unwrap();
        assert_eq!(msg.tag_value("a"), Some(""));
        assert_eq!(msg.tags[1].value, None);
    }

    #[test]
    fn parse_empty_tag_key_rejected() {
        assert!("@=v PING :x".parse::<Message>().is_err());
    }

    #[test]
    fn parse_lone_colon_is_empty_trailing() {
        let msg: Message = "TOPIC #chan :".parse().unwrap();
        assert_eq!(msg.params, vec!["#chan", ""]);
    }

    #[test]
    fn parse_missing_command() {
        assert!("".parse::<Message>().is_err());
        assert!(":prefix".parse::<Message>().is_err());
        assert!("@a=b".parse::<Message>().is_err());
    }

    #[test]
    fn parse_numeric() {
        let msg: Message = ":srv 001 nick :Welcome".parse().unwrap();
        assert_eq!(msg.command, "001");
    }

    #[test]
    fn parse_collapses_extra_spaces() {
        let msg: Message = "JOIN   #a  #b".parse().unwrap();
        assert_eq!(msg.params, vec!["#a", "#b"]);
    }

    #[test]
    fn parse_lowercase_command_uppercased() {
        let msg: Message = "privmsg #a :hi".parse().unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }
}
