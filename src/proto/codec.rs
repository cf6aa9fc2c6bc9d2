//! Tokio codecs for newline-terminated protocol lines.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::{MAX_LINE_LEN, Message, ProtocolError};

/// Line-based codec. Invalid UTF-8 is replaced rather than rejected so a
/// single bad line never poisons the stream.
#[derive(Debug)]
pub struct LineCodec {
    /// Index of next byte to check for newline
    next_index: usize,
    max_len: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_len(MAX_LINE_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            if line.len() > self.max_len {
                return Err(ProtocolError::MessageTooLong {
                    actual: line.len(),
                    limit: self.max_len,
                });
            }

            let data = String::from_utf8_lossy(&line);
            Ok(Some(data.trim_end_matches(['\r', '\n']).to_owned()))
        } else {
            self.next_index = src.len();

            if src.len() > self.max_len {
                return Err(ProtocolError::MessageTooLong {
                    actual: src.len(),
                    limit: self.max_len,
                });
            }

            Ok(None)
        }
    }

    /// An unterminated tail at end of stream is not a line; drop it.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "Dropping unterminated line at end of stream");
            src.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(line.len() + 2);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

/// One decoded line: either a message or a recoverable parse error.
pub type ParsedLine = Result<Message, ProtocolError>;

/// Message codec on top of [`LineCodec`].
///
/// Decoder errors are fatal for the stream (I/O, over-long line). A line
/// that frames correctly but does not parse is yielded as `Some(Err(_))`,
/// because a `Framed` stream terminates after its first decoder error.
/// Blank lines are skipped.
#[derive(Debug, Default)]
pub struct IrcCodec {
    inner: LineCodec,
}

impl IrcCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip anything from the first line ending on, so a param can never
    /// smuggle a second command onto the wire.
    pub fn sanitize(mut line: String) -> String {
        if let Some(pos) = line.find(['\r', '\n']) {
            line.truncate(pos);
        }
        line
    }
}

impl Decoder for IrcCodec {
    type Item = ParsedLine;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ParsedLine>, ProtocolError> {
        loop {
            match self.inner.decode(src)? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(line.parse::<Message>())),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ParsedLine>, ProtocolError> {
        loop {
            match self.inner.decode_eof(src)? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(line.parse::<Message>())),
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.inner.encode(Self::sanitize(msg.to_string()), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from("PING :tmi");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b".twitch.tv\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(msg.is("PING"));
        assert_eq!(msg.param(0), Some("tmi.twitch.tv"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_skips_blank_and_yields_parse_errors() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from("\r\n\r\n:bad?\r\nPING x\r\n");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.unwrap_err().is_recoverable());
        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(second.is("PING"));
    }

    #[test]
    fn test_decode_invalid_utf8_is_lossy() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(&b"PRIVMSG #x :caf\xff\r\n"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(msg.param(1).unwrap().starts_with("caf"));
    }

    #[test]
    fn test_decode_eof_drops_unterminated_tail() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from("PING :a\r\n\r\nPRIVMSG #x :cut sh");
        let msg = codec.decode_eof(&mut buf).unwrap().unwrap().unwrap();
        assert!(msg.is("PING"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_too_long_is_fatal() {
        let mut codec = LineCodec::with_max_len(10);
        let mut buf = BytesMut::from("this is way too long\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn test_encode_appends_crlf_and_sanitizes() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::privmsg("#foo", "hi\r\nQUIT"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"PRIVMSG #foo hi\r\n");
    }
}
