//! STOMP frame encoding and incremental parsing.
//!
//! Wire format (STOMP 1.1):
//! - command line
//! - zero or more `name:value` header lines
//! - blank line
//! - body, terminated by a NUL byte
//!
//! Lines end in LF, optionally preceded by CR. Bare EOLs between frames are
//! heart-beats and are skipped. Header names and values are escaped (`\\`,
//! `\n`, `\c`, `\r`) in every frame except CONNECT and CONNECTED.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::StompError;

/// Largest frame the parser will buffer before giving up.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// STOMP frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    // Server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let command = match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        };
        Some(command)
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected | Command::Stomp)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A STOMP frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Repeated names are allowed; the first wins.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Broker-assigned message id of a MESSAGE frame.
    pub fn message_id(&self) -> Option<&str> {
        self.get("message-id")
    }

    /// Subscription id of a MESSAGE frame.
    pub fn subscription(&self) -> Option<&str> {
        self.get("subscription")
    }

    /// Human readable error text of an ERROR frame.
    pub fn error_text(&self) -> String {
        let message = self.get("message").unwrap_or("(no message header)");
        let body = String::from_utf8_lossy(&self.body);
        let body = body.trim();
        if body.is_empty() {
            message.to_string()
        } else {
            format!("{message}: {body}")
        }
    }

    /// Serialize the frame, appending to `dst`.
    ///
    /// A `content-length` header is added for non-empty bodies unless one is
    /// already present.
    pub fn encode(&self, dst: &mut BytesMut) {
        let escape = self.command.escapes_headers();

        dst.put_slice(self.command.as_str().as_bytes());
        dst.put_u8(b'\n');

        for (name, value) in &self.headers {
            put_header_part(dst, name, escape);
            dst.put_u8(b':');
            put_header_part(dst, value, escape);
            dst.put_u8(b'\n');
        }

        if !self.body.is_empty() && self.get("content-length").is_none() {
            dst.put_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        dst.put_u8(b'\n');
        dst.put_slice(&self.body);
        dst.put_u8(0);
    }

    /// Serialize the frame into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.body.len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| {
                if k == "passcode" {
                    (k.as_str(), "<redacted>")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();

        f.debug_struct("Frame")
            .field("command", &self.command)
            .field("headers", &headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

fn put_header_part(dst: &mut BytesMut, s: &str, escape: bool) {
    if !escape {
        dst.put_slice(s.as_bytes());
        return;
    }

    for c in s.chars() {
        match c {
            '\\' => dst.put_slice(b"\\\\"),
            '\n' => dst.put_slice(b"\\n"),
            '\r' => dst.put_slice(b"\\r"),
            ':' => dst.put_slice(b"\\c"),
            c => {
                let mut tmp = [0u8; 4];
                dst.put_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(StompError::Malformed(format!(
                    "invalid header escape \\{other}"
                )))
            }
            None => return Err(StompError::Malformed("dangling header escape".to_string())),
        }
    }
    Ok(out)
}

/// Try to parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; nothing is consumed in that
/// case except leading heart-beat EOLs. On success the frame's bytes are
/// removed from `buf`.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, StompError> {
    // Heart-beats
    loop {
        if buf.starts_with(b"\n") {
            buf.advance(1);
        } else if buf.starts_with(b"\r\n") {
            buf.advance(2);
        } else {
            break;
        }
    }

    if buf.is_empty() {
        return Ok(None);
    }

    let mut pos = 0;
    let mut lines: Vec<&[u8]> = Vec::new();
    loop {
        let Some(nl) = buf[pos..].iter().position(|b| *b == b'\n') else {
            return incomplete(buf);
        };
        let mut line = &buf[pos..pos + nl];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        pos += nl + 1;
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }

    let Some((command_line, header_lines)) = lines.split_first() else {
        return Err(StompError::Malformed("frame has no command".to_string()));
    };

    let command_str = std::str::from_utf8(command_line)
        .map_err(|_| StompError::Malformed("command is not UTF-8".to_string()))?;
    let command = Command::parse(command_str)
        .ok_or_else(|| StompError::Malformed(format!("unknown command {command_str:?}")))?;

    let escaped = command.escapes_headers();
    let mut headers = Vec::with_capacity(header_lines.len());
    for line in header_lines {
        let line = std::str::from_utf8(line)
            .map_err(|_| StompError::Malformed("header is not UTF-8".to_string()))?;
        let Some((name, value)) = line.split_once(':') else {
            return Err(StompError::Malformed(format!("header without colon: {line:?}")));
        };
        if escaped {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| StompError::Malformed(format!("invalid content-length {v:?}")))
        })
        .transpose()?;

    let body_start = pos;
    let body_end = match content_length {
        Some(len) => {
            if len > MAX_FRAME_SIZE {
                return Err(StompError::FrameTooLarge {
                    limit: MAX_FRAME_SIZE,
                });
            }
            if buf.len() < body_start + len + 1 {
                return incomplete(buf);
            }
            if buf[body_start + len] != 0 {
                return Err(StompError::Malformed(
                    "body not terminated by NUL after content-length".to_string(),
                ));
            }
            body_start + len
        }
        None => match buf[body_start..].iter().position(|b| *b == 0) {
            Some(off) => body_start + off,
            None => return incomplete(buf),
        },
    };

    buf.advance(body_start);
    let body = buf.split_to(body_end - body_start).freeze();
    buf.advance(1); // NUL

    Ok(Some(Frame {
        command,
        headers,
        body,
    }))
}

fn incomplete(buf: &BytesMut) -> Result<Option<Frame>, StompError> {
    if buf.len() > MAX_FRAME_SIZE {
        return Err(StompError::FrameTooLarge {
            limit: MAX_FRAME_SIZE,
        });
    }
    Ok(None)
}
