use crate::error::MessageParseError;

/// An IRCv3 message tag.
///
/// The value distinguishes "present but empty" (`key=`) from absent
/// (`key` alone); both are legal on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag key, e.g. `time` or `msgid`.
    pub key: String,
    /// Decoded (unescaped) tag value, if any.
    pub value: Option<String>,
}

impl Tag {
    /// Create a new tag.
    pub fn new(key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        Tag {
            key: key.into(),
            value: value.map(Into::into),
        }
    }
}

/// The source prefix of a message: `name[!user][@host]`.
///
/// `name` is either a nickname or a server name; the distinction does not
/// matter to a relay and is not encoded here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Nickname or server name.
    pub name: String,
    /// The `user` part, if present.
    pub user: Option<String>,
    /// The `host` part, if present.
    pub host: Option<String>,
}

impl Source {
    /// Source consisting of a bare name.
    pub fn new(name: impl Into<String>) -> Self {
        Source {
            name: name.into(),
            user: None,
            host: None,
        }
    }

    /// Parse a `name[!user][@host]` prefix (without the leading `:`).
    pub fn parse(s: &str) -> Self {
        let (rest, host) = match s.split_once('@') {
            Some((rest, host)) => (rest, Some(host.to_string())),
            None => (s, None),
        };
        let (name, user) = match rest.split_once('!') {
            Some((name, user)) => (name.to_string(), Some(user.to_string())),
            None => (rest.to_string(), None),
        };
        Source { name, user, host }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if let Some(user) = &self.user {
            write!(f, "!{user}")?;
        }
        if let Some(host) = &self.host {
            write!(f, "@{host}")?;
        }
        Ok(())
    }
}

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 tags, in wire order. Empty when the line had no tag section.
    pub tags: Vec<Tag>,
    /// Message source, if the line carried a prefix.
    pub source: Option<Source>,
    /// Command, uppercased (letters) or a three-digit numeric.
    pub command: String,
    /// Parameters. The last one may contain spaces or be empty; the
    /// serializer emits it in trailing form when it has to.
    pub params: Vec<String>,
}

impl Message {
    /// Build a message from a command and parameters.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Message {
            tags: Vec::new(),
            source: None,
            command: command.into().to_ascii_uppercase(),
            params,
        }
    }

    /// Validate a command token: letters, or exactly three digits.
    pub(crate) fn validate_command(cmd: &str) -> Result<(), MessageParseError> {
        if cmd.is_empty() {
            return Err(MessageParseError::MissingCommand);
        }
        let letters = cmd.bytes().all(|b| b.is_ascii_alphabetic());
        let numeric = cmd.len() == 3 && cmd.bytes().all(|b| b.is_ascii_digit());
        if letters || numeric {
            Ok(())
        } else {
            Err(MessageParseError::InvalidCommand(cmd.to_string()))
        }
    }

    /// Attach a source.
    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Append a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }

    /// Look up a tag value by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .and_then(|t| t.value.as_deref())
    }

    /// The `label` tag, if present (labeled-response).
    pub fn label(&self) -> Option<&str> {
        self.tag_value("label")
    }

    /// The `time` tag, if present (server-time).
    pub fn server_time(&self) -> Option<&str> {
        self.tag_value("time")
    }

    /// Remove a tag by key, returning whether one was removed.
    pub fn remove_tag(&mut self, key: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t.key != key);
        self.tags.len() != before
    }

    /// Nickname of the source, if the message has one.
    pub fn source_name(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.name.as_str())
    }

    /// First parameter, if any.
    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// A PRIVMSG to a target.
    pub fn privmsg(target: impl Into<String>, text: impl Into<String>) -> Self {
        Message::new("PRIVMSG", vec![target.into(), text.into()])
    }

    /// A NOTICE to a target.
    pub fn notice(target: impl Into<String>, text: impl Into<String>) -> Self {
        Message::new("NOTICE", vec![target.into(), text.into()])
    }

    /// A JOIN for one channel, with an optional key.
    pub fn join(channel: impl Into<String>, key: Option<String>) -> Self {
        let mut params = vec![channel.into()];
        if let Some(key) = key {
            params.push(key);
        }
        Message::new("JOIN", params)
    }

    /// A PART for one channel.
    pub fn part(channel: impl Into<String>, reason: Option<String>) -> Self {
        let mut params = vec![channel.into()];
        if let Some(reason) = reason {
            params.push(reason);
        }
        Message::new("PART", params)
    }

    /// A PING with a token.
    pub fn ping(token: impl Into<String>) -> Self {
        Message::new("PING", vec![token.into()])
    }

    /// A PONG echoing a token.
    pub fn pong(token: impl Into<String>) -> Self {
        Message::new("PONG", vec![token.into()])
    }

    /// A NICK change.
    pub fn nick(nick: impl Into<String>) -> Self {
        Message::new("NICK", vec![nick.into()])
    }

    /// A QUIT with a reason.
    pub fn quit(reason: impl Into<String>) -> Self {
        Message::new("QUIT", vec![reason.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parse_full() {
        let src = Source::parse("nick!user@host");
        assert_eq!(src.name, "nick");
        assert_eq!(src.user.as_deref(), Some("user"));
        assert_eq!(src.host.as_deref(), Some("host"));
        assert_eq!(src.to_string(), "nick!user@host");
    }

    #[test]
    fn source_parse_server() {
        let src = Source::parse("irc.example.org");
        assert_eq!(src.name, "irc.example.org");
        assert!(src.user.is_none());
        assert!(src.host.is_none());
    }

    #[test]
    fn source_parse_host_only() {
        let src = Source::parse("nick@host");
        assert_eq!(src.name, "nick");
        assert!(src.user.is_none());
        assert_eq!(src.host.as_deref(), Some("host"));
    }

    #[test]
    fn command_uppercased() {
        let msg = Message::new("privmsg", vec!["#a".into(), "hi".into()]);
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn command_validation() {
        assert!(Message::validate_command("PRIVMSG").is_ok());
        assert!(Message::validate_command("001").is_ok());
        assert!(Message::validate_command("").is_err());
        assert!(Message::validate_command("01").is_err());
        assert!(Message::validate_command("1A2").is_err());
    }

    #[test]
    fn tag_lookup_distinguishes_empty_and_absent() {
        let msg = Message::ping("x")
            .with_tag("a", Some(""))
            .with_tag("b", None::<String>);
        assert_eq!(msg.tag_value("a"), Some(""));
        assert_eq!(msg.tag_value("b"), None);
        assert!(msg.tags.iter().any(|t| t.key == "b"));
    }
}
