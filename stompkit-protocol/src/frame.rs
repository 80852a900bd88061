/// Frame definition shared by the encoder, the decoder and the session
use std::fmt;

use tokio_util::bytes::Bytes;

use crate::header::{self, Header};

/// Frame commands. `Unknown` keeps whatever a newer broker sent us.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Command {
    Stomp,
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
    Unknown(String),
}

impl Command {
    pub fn parse(text: &str) -> Command {
        use Command::*;
        match text {
            "STOMP" => Stomp,
            "CONNECT" => Connect,
            "CONNECTED" => Connected,
            "SUBSCRIBE" => Subscribe,
            "UNSUBSCRIBE" => Unsubscribe,
            "SEND" => Send,
            "ACK" => Ack,
            "NACK" => Nack,
            "BEGIN" => Begin,
            "COMMIT" => Commit,
            "ABORT" => Abort,
            "DISCONNECT" => Disconnect,
            "MESSAGE" => Message,
            "RECEIPT" => Receipt,
            "ERROR" => Error,
            other => Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        use Command::*;
        match self {
            Stomp => "STOMP",
            Connect => "CONNECT",
            Connected => "CONNECTED",
            Subscribe => "SUBSCRIBE",
            Unsubscribe => "UNSUBSCRIBE",
            Send => "SEND",
            Ack => "ACK",
            Nack => "NACK",
            Begin => "BEGIN",
            Commit => "COMMIT",
            Abort => "ABORT",
            Disconnect => "DISCONNECT",
            Message => "MESSAGE",
            Receipt => "RECEIPT",
            Error => "ERROR",
            Unknown(text) => text,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Command::Unknown(_))
    }

    // Header text of the connection handshake frames is never escaped
    pub(crate) fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Stomp | Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message: a command, ordered headers and an opaque body.
///
/// Headers keep insertion order and may repeat; lookups return the first
/// occurrence, which is the one the protocol considers authoritative.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Frame {
    command: Command,
    headers: Vec<Header>,
    body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_parts(command: Command, headers: Vec<Header>, body: impl Into<Bytes>) -> Self {
        Self {
            command,
            headers,
            body: body.into(),
        }
    }

    /// Append a header, keeping any earlier header with the same key
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    pub fn headers_from<I, H>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Into<Header>,
    {
        self.headers.extend(headers.into_iter().map(Into::into));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Value of the first header named `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Declared `content-length`, if present and well formed
    pub fn content_length(&self) -> Option<usize> {
        self.get(header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn into_parts(self) -> (Command, Vec<Header>, Bytes) {
        (self.command, self.headers, self.body)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.command)?;
        for header in &self.headers {
            writeln!(f, "{header}")?;
        }
        match self.body_text() {
            Some(text) => write!(f, "\n{text}"),
            None => write!(f, "\n<{} bytes of binary content>", self.body.len()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Command, Frame};

    #[test]
    fn test_command_text() {
        for text in ["CONNECTED", "MESSAGE", "RECEIPT", "ERROR", "SEND", "NACK"] {
            let command = Command::parse(text);
            assert!(!command.is_unknown());
            assert_eq!(command.as_str(), text);
        }
        assert_eq!(Command::parse("PING"), Command::Unknown("PING".into()));
        assert_eq!(Command::parse("send"), Command::Unknown("send".into()));
    }

    #[test]
    fn test_first_header_wins() {
        let frame = Frame::new(Command::Message)
            .header("destination", "/queue/a")
            .header("destination", "/queue/b");
        assert_eq!(frame.get("destination"), Some("/queue/a"));
        assert_eq!(frame.headers().len(), 2);
        assert_eq!(frame.get("subscription"), None);
    }

    #[test]
    fn test_content_length() {
        let frame = Frame::new(Command::Message).header("content-length", " 12 ");
        assert_eq!(frame.content_length(), Some(12));
        let bad = Frame::new(Command::Message).header("content-length", "-1");
        assert_eq!(bad.content_length(), None);
        assert_eq!(Frame::new(Command::Message).content_length(), None);
    }

    #[test]
    fn test_into_parts() {
        let (command, headers, body) = Frame::new(Command::Send)
            .header("destination", "/queue/a")
            .body("hi")
            .into_parts();
        assert_eq!(command, Command::Send);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].to_string(), "destination:/queue/a");
        assert_eq!(&body[..], b"hi");
    }

    #[test]
    fn test_display() {
        let frame = Frame::new(Command::Send)
            .header("destination", "/queue/a")
            .body("hello");
        assert_eq!(frame.to_string(), "SEND\ndestination:/queue/a\n\nhello");
        let binary = Frame::new(Command::Send).body(vec![0xff, 0x00]);
        assert!(binary.to_string().contains("<2 bytes of binary content>"));
    }
}
