use std::fmt::{self, Write};
use std::str::FromStr;

use super::ProtocolError;

/// A single IRCv3 message tag. The value is stored unescaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

/// An owned protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tags: Option<Vec<Tag>>,
    /// Source of the message without the leading `:`.
    pub prefix: Option<String>,
    /// Command name or numeric, uppercased on parse.
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Build a message with no tags and no prefix.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            tags: None,
            prefix: None,
            command: command.into(),
            params,
        }
    }

    pub fn pass(pass: &str) -> Self {
        Self::new("PASS", vec![pass.to_owned()])
    }

    pub fn nick(nick: &str) -> Self {
        Self::new("NICK", vec![nick.to_owned()])
    }

    /// `CAP REQ :<caps...>`
    pub fn cap_req(caps: &[String]) -> Self {
        Self::new("CAP", vec!["REQ".to_owned(), caps.join(" ")])
    }

    /// One combined `JOIN` for all given channels.
    pub fn join(channels: &[String]) -> Self {
        Self::new("JOIN", vec![channels.join(",")])
    }

    /// One combined `PART` for all given channels.
    pub fn part(channels: &[String]) -> Self {
        Self::new("PART", vec![channels.join(",")])
    }

    pub fn privmsg(target: &str, body: &str) -> Self {
        Self::new("PRIVMSG", vec![target.to_owned(), body.to_owned()])
    }

    pub fn ping(token: &str) -> Self {
        Self::new("PING", vec![token.to_owned()])
    }

    /// Reply to a `PING`, echoing its params.
    pub fn pong(params: &[String]) -> Self {
        Self::new("PONG", params.to_vec())
    }

    pub fn quit(reason: Option<&str>) -> Self {
        Self::new("QUIT", reason.map(str::to_owned).into_iter().collect())
    }

    #[inline]
    pub fn is(&self, command: &str) -> bool {
        self.command.eq_ignore_ascii_case(command)
    }

    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .as_ref()?
            .iter()
            .find(|t| t.0 == key)
            .and_then(|t| t.1.as_deref())
    }

    /// Nickname part of a `nick!user@host` prefix.
    pub fn source_nickname(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        prefix.split(['!', '@']).next().filter(|s| !s.is_empty())
    }
}

fn escape_tag_value(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    for c in value.chars() {
        match c {
            ';' => f.write_str("\\:")?,
            ' ' => f.write_str("\\s")?,
            '\\' => f.write_str("\\\\")?,
            '\r' => f.write_str("\\r")?,
            '\n' => f.write_str("\\n")?,
            c => f.write_char(c)?,
        }
    }
    Ok(())
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        let r = if c == '\\' {
            match iter.next() {
                Some(':') => ';',
                Some('s') => ' ',
                Some('\\') => '\\',
                Some('r') => '\r',
                Some('n') => '\n',
                Some(c) => c,
                None => break,
            }
        } else {
            c
        };
        out.push(r);
    }
    out
}

fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(';')
        .filter(|s| !s.is_empty())
        .map(|tag| {
            let mut it = tag.splitn(2, '=');
            let key = it.next().unwrap_or_default().to_owned();
            let value = it.next().map(unescape_tag_value);
            Tag(key, value)
        })
        .collect()
}

/// Split off the next space-delimited token, skipping leading spaces.
fn next_token(s: &str) -> (&str, &str) {
    let s = s.trim_start_matches(' ');
    match s.find(' ') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ProtocolError::InvalidMessage {
            line: s.to_owned(),
            reason,
        };

        let mut rest = s.trim_end_matches(['\r', '\n']);
        if rest.trim().is_empty() {
            return Err(invalid("empty message"));
        }

        let mut tags = None;
        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw, tail) = next_token(stripped);
            tags = Some(parse_tags(raw));
            rest = tail;
        }

        let mut prefix = None;
        let trimmed = rest.trim_start_matches(' ');
        if let Some(stripped) = trimmed.strip_prefix(':') {
            let (raw, tail) = next_token(stripped);
            if raw.is_empty() {
                return Err(invalid("empty prefix"));
            }
            prefix = Some(raw.to_owned());
            rest = tail;
        }

        let (command, mut rest) = next_token(rest);
        if command.is_empty() {
            return Err(invalid("missing command"));
        }
        if !command.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("malformed command"));
        }

        let mut params = Vec::new();
        loop {
            let trimmed = rest.trim_start_matches(' ');
            if trimmed.is_empty() {
                break;
            }
            if let Some(trailing) = trimmed.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            let (param, tail) = next_token(trimmed);
            params.push(param.to_owned());
            rest = tail;
        }

        Ok(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

impl fmt::Display for Message {
    /// Wire form without the terminating CRLF.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = self.tags.as_ref().filter(|t| !t.is_empty()) {
            f.write_char('@')?;
            for (i, Tag(key, value)) in tags.iter().enumerate() {
                if i > 0 {
                    f.write_char(';')?;
                }
                f.write_str(key)?;
                if let Some(value) = value {
                    f.write_char('=')?;
                    escape_tag_value(f, value)?;
                }
            }
            f.write_char(' ')?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            let needs_colon =
                i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':'));
            if needs_colon {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}
