//! Tokio codec for IRC lines.
//!
//! Decoding enforces the wire budgets separately: the tag section (leading
//! `@` through its terminating space) may be up to [`MAX_TAGS_LEN`] bytes,
//! the remainder of the line up to [`MAX_LINE_LEN`] bytes, CRLF included.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::Message;
use crate::{MAX_LINE_LEN, MAX_TAGS_LEN};

/// Encodes and decodes [`Message`] values with CRLF framing.
#[derive(Debug, Default)]
pub struct IrcCodec {
    /// Index of the next byte to check for a line feed.
    next_index: usize,
}

impl IrcCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_budgets(line: &[u8]) -> Result<(), ProtocolError> {
        let non_tag_len = if line.first() == Some(&b'@') {
            let tags_len = match line.iter().position(|&b| b == b' ') {
                // The space separating tags from the rest counts against
                // the tag budget.
                Some(idx) => idx + 1,
                None => line.len(),
            };
            if tags_len > MAX_TAGS_LEN {
                return Err(ProtocolError::TagsTooLong {
                    actual: tags_len,
                    limit: MAX_TAGS_LEN,
                });
            }
            line.len() - tags_len
        } else {
            line.len()
        };

        if non_tag_len > MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong {
                actual: non_tag_len,
                limit: MAX_LINE_LEN,
            });
        }
        Ok(())
    }
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(offset) = src[self.next_index..].iter().position(|&b| b == b'\n') else {
            self.next_index = src.len();
            // A partial line can already be hopeless.
            if src.len() > MAX_TAGS_LEN + MAX_LINE_LEN {
                return Err(ProtocolError::LineTooLong {
                    actual: src.len(),
                    limit: MAX_TAGS_LEN + MAX_LINE_LEN,
                });
            }
            return Ok(None);
        };

        let line = src.split_to(self.next_index + offset + 1);
        self.next_index = 0;

        Self::check_budgets(&line)?;

        let text = std::str::from_utf8(&line).map_err(|e| ProtocolError::InvalidUtf8 {
            byte_pos: e.valid_up_to(),
        })?;

        let trimmed = text.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            // Bare CRLF between messages; skip it.
            return self.decode(src);
        }

        trimmed.parse::<Message>().map(Some)
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        Encoder::<&Message>::encode(self, &msg, dst)
    }
}

impl Encoder<&Message> for IrcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let line = msg.to_string();
        for ch in line.chars() {
            if matches!(ch, '\r' | '\n' | '\0') {
                return Err(ProtocolError::IllegalControlChar(ch));
            }
        }
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(raw: &[u8]) -> Result<Option<Message>, ProtocolError> {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(raw);
        codec.decode(&mut buf)
    }

    #[test]
    fn decode_complete_line() {
        let msg = decode_one(b"PING :abc\r\n").unwrap().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn decode_partial_line() {
        assert!(decode_one(b"PING :ab").unwrap().is_none());
    }

    #[test]
    fn decode_resumes_across_feeds() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(&b"PRIVMSG #a "[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b":hi\r\nPING x\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "PRIVMSG");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "PING");
    }

    #[test]
    fn line_at_512_accepted() {
        // "PRIVMSG #c :" + fill + CRLF, exactly 512 bytes total.
        let fill = "x".repeat(512 - "PRIVMSG #c :".len() - 2);
        let raw = format!("PRIVMSG #c :{fill}\r\n");
        assert_eq!(raw.len(), 512);
        assert!(decode_one(raw.as_bytes()).unwrap().is_some());
    }

    #[test]
    fn line_at_513_rejected() {
        let fill = "x".repeat(513 - "PRIVMSG #c :".len() - 2);
        let raw = format!("PRIVMSG #c :{fill}\r\n");
        assert_eq!(raw.len(), 513);
        assert!(matches!(
            decode_one(raw.as_bytes()),
            Err(ProtocolError::LineTooLong { .. })
        ));
    }

    #[test]
    fn tags_do_not_count_against_line_budget() {
        let tag_fill = "y".repeat(600);
        let raw = format!("@k={tag_fill} PING :x\r\n");
        assert!(decode_one(raw.as_bytes()).unwrap().is_some());
    }

    #[test]
    fn oversize_tags_rejected() {
        let tag_fill = "y".repeat(MAX_TAGS_LEN + 10);
        let raw = format!("@k={tag_fill} PING :x\r\n");
        assert!(matches!(
            decode_one(raw.as_bytes()),
            Err(ProtocolError::TagsTooLong { .. })
        ));
    }

    #[test]
    fn invalid_utf8_rejected() {
        assert!(matches!(
            decode_one(b"PRIVMSG #c :\xff\xfe\r\n"),
            Err(ProtocolError::InvalidUtf8 { .. })
        ));
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::ping("x"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PING x\r\n");
    }

    #[test]
    fn encode_rejects_interior_newline() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::new();
        let msg = Message::new("PRIVMSG", vec!["#c".into(), "a\nb".into()]);
        assert!(codec.encode(msg, &mut buf).is_err());
    }

    #[test]
    fn blank_lines_skipped() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(&b"\r\nPING x\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "PING");
    }
}
