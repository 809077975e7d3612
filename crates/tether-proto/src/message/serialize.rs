//! Message serialization: `Display` for [`Message`].
//!
//! The output carries no line terminator; the codec appends CRLF.

use std::fmt;

use super::tags::escape_tag_value;
use super::types::Message;

/// A middle parameter can be emitted bare; the last parameter needs the
/// trailing form when it is empty, contains a space, or starts with `:`.
fn needs_trailing(param: &str) -> bool {
    param.is_empty() || param.contains(' ') || param.starts_with(':')
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            f.write_str("@")?;
            for (i, tag) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                f.write_str(&tag.key)?;
                if let Some(value) = &tag.value {
                    f.write_str("=")?;
                    escape_tag_value(f, value)?;
                }
            }
            f.write_str(" ")?;
        }

        if let Some(source) = &self.source {
            write!(f, ":{source} ")?;
        }

        f.write_str(&self.command)?;

        if let Some((last, middles)) = self.params.split_last() {
            for param in middles {
                write!(f, " {param}")?;
            }
            if needs_trailing(last) {
                write!(f, " :{last}")?;
            } else {
                write!(f, " {last}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Source;

    #[test]
    fn serialize_simple() {
        let msg = Message::new("PING", vec!["token".into()]);
        assert_eq!(msg.to_string(), "PING token");
    }

    #[test]
    fn serialize_trailing_with_space() {
        let msg = Message::privmsg("#chan", "hello world");
        assert_eq!(msg.to_string(), "PRIVMSG #chan :hello world");
    }

    #[test]
    fn serialize_empty_trailing() {
        let msg = Message::new("TOPIC", vec!["#chan".into(), String::new()]);
        assert_eq!(msg.to_string(), "TOPIC #chan :");
    }

    #[test]
    fn serialize_trailing_starting_with_colon() {
        let msg = Message::privmsg("#chan", ":)");
        assert_eq!(msg.to_string(), "PRIVMSG #chan ::)");
    }

    #[test]
    fn serialize_tags_and_source() {
        let msg = Message::privmsg("#c", "hi")
            .with_tag("time", Some("2024-01-01T00:00:00.000Z"))
            .with_tag("bot", None::<String>)
            .with_source(Source::parse("n!u@h"));
        assert_eq!(
            msg.to_string(),
            "@time=2024-01-01T00:00:00.000Z;bot :n!u@h PRIVMSG #c hi"
        );
    }

    #[test]
    fn serialize_escapes_tag_values() {
        let msg = Message::ping("x").with_tag("k", Some("a b;c"));
        assert_eq!(msg.to_string(), "@k=a\\sb\\:c PING x");
    }

    #[test]
    fn roundtrip() {
        for raw in [
            "PRIVMSG #chan :hello world",
            "@time=2024-01-01T00:00:00.000Z :n!u@h PRIVMSG #c :hi there",
            "TOPIC #chan :",
            "JOIN #a,#b key1,key2",
            ":srv 005 nick CASEMAPPING=rfc1459 :are supported by this server",
        ] {
            let msg: Message = raw.parse().unwrap();
            assert_eq!(msg.to_string(), raw);
        }
    }
}
