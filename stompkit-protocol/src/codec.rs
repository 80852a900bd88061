/// Codec for STOMP frames
use crate::{
    frame::{Command, Frame},
    header::{self, Header},
    util::ResultExt,
    Error, Version,
};
use tokio_util::{
    bytes::{Buf, BufMut, BytesMut},
    codec::{Decoder, Encoder},
};

// 640k ought to be enough for anyone
pub const MAX_LENGTH: usize = 1024 * 640;

/// Bytes of a heart-beat: a lone end-of-line between frames
pub const HEARTBEAT: &[u8] = b"\n";

/// Where the decoder is within the frame currently being read
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    CommandLine,
    HeaderLine,
    HeaderValue,
    Body,
    // counted body fully read, terminating NUL still expected
    BodyEnd,
    // discarding the rest of a bad frame up to the next NUL
    Skip,
}

/// Encoder and streaming decoder for STOMP frames.
///
/// The decoder consumes every byte it is given and keeps partial frames
/// internally, so a frame may be split across any number of calls. A decode
/// error discards only the offending frame; the next call resumes at the
/// following NUL boundary.
#[derive(Debug)]
pub struct FrameCodec {
    version: Version,
    max_length: usize,
    state: State,
    command: Vec<u8>,
    parsed_command: Option<Command>,
    key: Vec<u8>,
    value: Vec<u8>,
    headers: Vec<Header>,
    content_length: Option<usize>,
    body: BytesMut,
    size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Version::default())
    }
}

impl FrameCodec {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            max_length: MAX_LENGTH,
            state: State::CommandLine,
            command: Vec::new(),
            parsed_command: None,
            key: Vec::new(),
            value: Vec::new(),
            headers: Vec::new(),
            content_length: None,
            body: BytesMut::new(),
            size: 0,
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Switch header escaping rules, typically once the version is negotiated
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Whether a frame has been partially read
    pub fn is_mid_frame(&self) -> bool {
        self.state != State::CommandLine || !self.command.is_empty()
    }

    fn reset(&mut self) {
        self.state = State::CommandLine;
        self.command.clear();
        self.parsed_command = None;
        self.key.clear();
        self.value.clear();
        self.headers.clear();
        self.content_length = None;
        self.body.clear();
        self.size = 0;
    }

    // Drop the frame in progress and resynchronize at the next NUL
    fn fail(&mut self, error: Error) -> Error {
        tracing::debug!(%error, "skipping to the next frame boundary");
        self.reset();
        self.state = State::Skip;
        error
    }

    // Drop the frame in progress when the offending byte was its NUL
    fn fail_at_boundary(&mut self, error: Error) -> Error {
        self.reset();
        error
    }

    fn account(&mut self, n: usize) -> Result<(), Error> {
        self.size += n;
        if self.size > self.max_length {
            let max = self.max_length;
            return Err(self.fail(Error::FrameTooLarge(max)));
        }
        Ok(())
    }

    fn step(&mut self, byte: u8) -> Result<Option<Frame>, Error> {
        match (self.state, byte) {
            (State::CommandLine, b'\n') => {
                strip_cr(&mut self.command);
                if self.command.is_empty() {
                    tracing::trace!("heart-beat received");
                    self.size = 0;
                    return Ok(None);
                }
                match self.parse_command() {
                    Ok(command) => {
                        self.parsed_command = Some(command);
                        self.state = State::HeaderLine;
                        Ok(None)
                    }
                    Err(e) => Err(self.fail(e)),
                }
            }
            (State::CommandLine | State::HeaderLine | State::HeaderValue, 0) => Err(self
                .fail_at_boundary(Error::MalformedFrame("NUL byte before end of headers".into()))),
            (State::CommandLine, b) => {
                self.command.push(b);
                Ok(None)
            }
            (State::HeaderLine, b':') => {
                self.state = State::HeaderValue;
                Ok(None)
            }
            (State::HeaderLine, b'\n') => {
                strip_cr(&mut self.key);
                if !self.key.is_empty() {
                    return Err(self.fail(Error::MalformedFrame("header line without ':'".into())));
                }
                self.begin_body()
            }
            (State::HeaderLine, b) => {
                self.key.push(b);
                Ok(None)
            }
            (State::HeaderValue, b'\n') => {
                strip_cr(&mut self.value);
                if let Err(e) = self.finish_header() {
                    return Err(self.fail(e));
                }
                self.state = State::HeaderLine;
                Ok(None)
            }
            (State::HeaderValue, b) => {
                self.value.push(b);
                Ok(None)
            }
            (State::BodyEnd, 0) => self.complete(),
            (State::BodyEnd, _) => {
                let declared = self.content_length.unwrap_or_default();
                Err(self.fail(Error::ContentLengthMismatch { declared }))
            }
            // Body and Skip consume input in bulk, see `decode`
            (State::Body | State::Skip, _) => Ok(None),
        }
    }

    fn parse_command(&self) -> Result<Command, Error> {
        let text = std::str::from_utf8(&self.command).or_malformed("command is not utf-8")?;
        if !text.bytes().all(|b| b.is_ascii_graphic() && b != b':') {
            return Err(Error::MalformedFrame(format!("invalid command line '{text}'")));
        }
        Ok(Command::parse(text))
    }

    fn finish_header(&mut self) -> Result<(), Error> {
        let escaped = self
            .parsed_command
            .as_ref()
            .map_or(true, Command::escapes_headers);
        let version = if escaped { self.version } else { Version::V1_0 };
        let key = header::unescape(&self.key, version)?;
        let value = header::unescape(&self.value, version)?;
        self.key.clear();
        self.value.clear();

        let first_length = key == header::CONTENT_LENGTH
            && !self.headers.iter().any(|h| h.key == header::CONTENT_LENGTH);
        if first_length {
            let length = value
                .trim()
                .parse::<usize>()
                .or_malformed("content-length is not a non-negative integer")?;
            self.content_length = Some(length);
        }
        self.headers.push(Header { key, value });
        Ok(())
    }

    fn begin_body(&mut self) -> Result<Option<Frame>, Error> {
        if let Some(length) = self.content_length {
            if self.size.saturating_add(length) > self.max_length {
                let max = self.max_length;
                return Err(self.fail(Error::FrameTooLarge(max)));
            }
            self.body.reserve(length);
        }
        self.state = State::Body;
        Ok(None)
    }

    fn read_body(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        match self.content_length {
            Some(length) => {
                let take = (length - self.body.len()).min(src.len());
                self.body.extend_from_slice(&src.split_to(take));
                self.size += take;
                if self.body.len() == length {
                    self.state = State::BodyEnd;
                }
                Ok(None)
            }
            None => match src.iter().position(|&b| b == 0) {
                Some(end) => {
                    if self.size + end > self.max_length {
                        src.advance(end + 1);
                        let max = self.max_length;
                        return Err(self.fail_at_boundary(Error::FrameTooLarge(max)));
                    }
                    self.body.extend_from_slice(&src[..end]);
                    src.advance(end + 1);
                    self.complete()
                }
                None => {
                    let n = src.len();
                    self.body.extend_from_slice(&src[..]);
                    src.clear();
                    self.account(n)?;
                    Ok(None)
                }
            },
        }
    }

    fn skip(&mut self, src: &mut BytesMut) {
        match src.iter().position(|&b| b == 0) {
            Some(end) => {
                src.advance(end + 1);
                self.reset();
            }
            None => src.clear(),
        }
    }

    fn complete(&mut self) -> Result<Option<Frame>, Error> {
        let command = self.parsed_command.take().unwrap_or(Command::Unknown(String::new()));
        let headers = std::mem::take(&mut self.headers);
        let body = self.body.split().freeze();
        self.reset();
        let frame = Frame::with_parts(command, headers, body);
        if frame.command().is_unknown() {
            return Err(Error::UnknownCommand(Box::new(frame)));
        }
        Ok(Some(frame))
    }
}

fn strip_cr(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while !src.is_empty() {
            match self.state {
                State::Body => {
                    if let Some(frame) = self.read_body(src)? {
                        return Ok(Some(frame));
                    }
                }
                State::Skip => self.skip(src),
                _ => {
                    let byte = src.get_u8();
                    // heart-beats and the terminating NUL are not part of the frame
                    if byte != 0 && (self.is_mid_frame() || byte != b'\n') {
                        self.account(1)?;
                    }
                    if let Some(frame) = self.step(byte)? {
                        return Ok(Some(frame));
                    }
                }
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        let error = match (self.state, self.content_length) {
            (State::Skip, _) => None,
            (State::Body | State::BodyEnd, Some(declared)) => {
                Some(Error::ContentLengthMismatch { declared })
            }
            _ if self.is_mid_frame() => {
                Some(Error::MalformedFrame("stream closed in the middle of a frame".into()))
            }
            _ => None,
        };
        self.reset();
        match error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let version = if frame.command().escapes_headers() {
            self.version
        } else {
            Version::V1_0
        };
        let body = frame.body_bytes();

        // Reserve enough space for full encoding to avoid reallocating
        dst.reserve(
            frame.command().as_str().len()
                + frame
                    .headers()
                    .iter()
                    .map(|h| h.key.len() + h.value.len() + 2)
                    .sum::<usize>()
                + body.len()
                + 32,
        );

        dst.put_slice(frame.command().as_str().as_bytes());
        dst.put_u8(b'\n');
        let mut line = Vec::new();
        for h in frame.headers() {
            line.clear();
            header::escape_into(&h.key, version, &mut line);
            line.push(b':');
            header::escape_into(&h.value, version, &mut line);
            line.push(b'\n');
            dst.put_slice(&line);
        }
        // A NUL inside the body would end the frame early without a length
        if !body.is_empty() && !frame.contains(header::CONTENT_LENGTH) && body.contains(&0) {
            dst.put_slice(format!("{}:{}\n", header::CONTENT_LENGTH, body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(body);
        dst.put_u8(0);
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Frame>::encode(self, &frame, dst)
    }
}

#[cfg(test)]
mod test {
    use super::FrameCodec;
    use crate::{Command, Error, Frame, Version};
    use tokio_util::{
        bytes::BytesMut,
        codec::{Decoder, Encoder},
    };

    fn do_encode(frame: &Frame, mut encoder: FrameCodec) -> Vec<u8> {
        let mut output = BytesMut::new();
        encoder.encode(frame, &mut output).unwrap();
        output.to_vec()
    }

    fn do_decode(bytes: &[u8], decoder: &mut FrameCodec) -> Vec<Result<Frame, Error>> {
        let mut buffer = BytesMut::from(bytes);
        let mut results = Vec::new();
        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(frame)) => results.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => results.push(Err(e)),
            }
        }
        assert!(buffer.is_empty());
        results
    }

    fn frames(results: Vec<Result<Frame, Error>>) -> Vec<Frame> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_encode_layout() {
        #[rustfmt::skip]
        let tests = vec![
            (
                Frame::new(Command::Send)
                    .header("destination", "/queue/a")
                    .header("content-type", "text/plain")
                    .body("hello"),
                &b"SEND\ndestination:/queue/a\ncontent-type:text/plain\n\nhello\0"[..],
            ),
            (
                Frame::new(Command::Disconnect).header("receipt", "receipt-1"),
                &b"DISCONNECT\nreceipt:receipt-1\n\n\0"[..],
            ),
            (
                Frame::new(Command::Begin),
                &b"BEGIN\n\n\0"[..],
            ),
        ];
        for (frame, bytes) in tests {
            assert_eq!(do_encode(&frame, FrameCodec::default()), bytes);
        }
    }

    #[test]
    fn test_encode_escapes_by_version() {
        let frame = Frame::new(Command::Send).header("note", "a:b\\c\r\n");
        #[rustfmt::skip]
        let tests = vec![
            (Version::V1_2, &b"SEND\nnote:a\\cb\\\\c\\r\\n\n\n\0"[..]),
            (Version::V1_1, &b"SEND\nnote:a\\cb\\\\c\r\\n\n\n\0"[..]),
            (Version::V1_0, &b"SEND\nnote:a:b\\c\r\n\n\n\0"[..]),
        ];
        for (version, bytes) in tests {
            assert_eq!(do_encode(&frame, FrameCodec::new(version)), bytes);
        }
    }

    #[test]
    fn test_connect_headers_are_not_escaped() {
        let frame = Frame::new(Command::Connect).header("passcode", "se:cret");
        assert_eq!(
            do_encode(&frame, FrameCodec::default()),
            b"CONNECT\npasscode:se:cret\n\n\0"
        );
    }

    #[test]
    fn test_encode_adds_content_length_for_binary_body() {
        let binary = Frame::new(Command::Send).body(&b"he\0lo"[..]);
        assert_eq!(
            do_encode(&binary, FrameCodec::default()),
            b"SEND\ncontent-length:5\n\nhe\0lo\0"
        );

        let text = Frame::new(Command::Send).body("hello");
        assert_eq!(do_encode(&text, FrameCodec::default()), b"SEND\n\nhello\0");

        let declared = Frame::new(Command::Send)
            .header("content-length", "5")
            .body(&b"he\0lo"[..]);
        assert_eq!(
            do_encode(&declared, FrameCodec::default()),
            b"SEND\ncontent-length:5\n\nhe\0lo\0"
        );
    }

    #[test]
    fn test_encode_leaves_frame_untouched() {
        let frame = Frame::new(Command::Send).body(&b"\0"[..]);
        let before = frame.clone();
        do_encode(&frame, FrameCodec::default());
        assert_eq!(frame, before);
    }

    #[test]
    fn test_roundtrip() {
        let tests = vec![
            Frame::new(Command::Message)
                .header("destination", "/topic/a")
                .header("message-id", "7")
                .header("subscription", "sub-1")
                .body("payload"),
            Frame::new(Command::Receipt).header("receipt-id", "receipt-3"),
            Frame::new(Command::Error)
                .header("message", "bad things")
                .header("content-length", "3")
                .body(&b"\0\0\0"[..]),
        ];
        for frame in tests {
            let mut codec = FrameCodec::default();
            let bytes = do_encode(&frame, FrameCodec::default());
            assert_eq!(frames(do_decode(&bytes, &mut codec)), vec![frame]);
        }
    }

    #[test]
    fn test_decode_counted_body_with_nul() {
        let mut codec = FrameCodec::default();
        let decoded = frames(do_decode(
            b"MESSAGE\ncontent-length:5\nsubscription:sub-1\n\nhe\0lo\0",
            &mut codec,
        ));
        assert_eq!(decoded.len(), 1);
        assert_eq!(&decoded[0].body_bytes()[..], b"he\0lo");
        assert!(!codec.is_mid_frame());
    }

    #[test]
    fn test_heartbeat_produces_nothing() {
        let mut codec = FrameCodec::default();
        assert!(do_decode(b"\n", &mut codec).is_empty());
        assert!(do_decode(b"\r\n\n", &mut codec).is_empty());
        assert!(!codec.is_mid_frame());

        let decoded = frames(do_decode(b"\nRECEIPT\nreceipt-id:1\n\n\0\n\n", &mut codec));
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].command(), &Command::Receipt);
    }

    #[test]
    fn test_malformed_content_length_resyncs() {
        let mut codec = FrameCodec::default();
        let results = do_decode(
            b"CONNECTED\ncontent-length:-bad-\n\n\0CONNECTED\nversion:1.2\n\n\0",
            &mut codec,
        );
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(Error::MalformedFrame(_))));
        let frame = results[1].as_ref().unwrap();
        assert_eq!(frame.command(), &Command::Connected);
        assert_eq!(frame.get("version"), Some("1.2"));
    }

    #[test]
    fn test_split_at_every_offset() {
        let bytes: &[u8] =
            b"MESSAGE\r\ndestination:/topic/a\r\ncontent-length:4\r\nsubscription:sub-1\r\n\r\nab\0c\0";
        let mut whole = FrameCodec::default();
        let expected = frames(do_decode(bytes, &mut whole));
        assert_eq!(expected.len(), 1);
        assert_eq!(expected[0].get("destination"), Some("/topic/a"));

        for offset in 0..=bytes.len() {
            let mut codec = FrameCodec::default();
            let (first, second) = bytes.split_at(offset);
            let mut decoded = frames(do_decode(first, &mut codec));
            decoded.extend(frames(do_decode(second, &mut codec)));
            assert_eq!(decoded, expected, "split at {offset}");
        }
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::default();
        let decoded = frames(do_decode(
            b"MESSAGE\nsubscription:sub-1\n\none\0\nMESSAGE\nsubscription:sub-2\n\ntwo\0",
            &mut codec,
        ));
        let bodies: Vec<_> = decoded.iter().map(|f| f.body_text().unwrap()).collect();
        assert_eq!(bodies, vec!["one", "two"]);
    }

    #[test]
    fn test_unknown_command_is_reported_and_skipped() {
        let mut codec = FrameCodec::default();
        let results = do_decode(b"PING\nx:y\n\n\0RECEIPT\nreceipt-id:9\n\n\0", &mut codec);
        assert_eq!(results.len(), 2);
        match &results[0] {
            Err(Error::UnknownCommand(frame)) => {
                assert_eq!(frame.command(), &Command::Unknown("PING".into()));
                assert_eq!(frame.get("x"), Some("y"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(results[1].as_ref().unwrap().get("receipt-id"), Some("9"));
    }

    #[test]
    fn test_header_without_colon_is_malformed() {
        let mut codec = FrameCodec::default();
        let results = do_decode(
            b"MESSAGE\nnocolon\n\nbody\0MESSAGE\nsubscription:sub-1\n\n\0",
            &mut codec,
        );
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(Error::MalformedFrame(_))));
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_counted_body_without_terminator() {
        let mut codec = FrameCodec::default();
        let results = do_decode(
            b"MESSAGE\ncontent-length:2\n\nabc\0RECEIPT\nreceipt-id:1\n\n\0",
            &mut codec,
        );
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(Error::ContentLengthMismatch { declared: 2 })
        ));
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_header_unescaping() {
        let mut codec = FrameCodec::default();
        let decoded = frames(do_decode(b"MESSAGE\nkey:a\\cb\\nc\n\n\0", &mut codec));
        assert_eq!(decoded[0].get("key"), Some("a:b\nc"));

        // handshake frames are taken literally
        let decoded = frames(do_decode(b"CONNECTED\nserver:a\\cb\n\n\0", &mut codec));
        assert_eq!(decoded[0].get("server"), Some("a\\cb"));

        let results = do_decode(b"MESSAGE\nkey:a\\tb\n\n\0", &mut codec);
        assert!(matches!(results[0], Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_first_content_length_wins() {
        let mut codec = FrameCodec::default();
        let decoded = frames(do_decode(
            b"MESSAGE\ncontent-length:3\ncontent-length:1\n\nabc\0",
            &mut codec,
        ));
        assert_eq!(&decoded[0].body_bytes()[..], b"abc");
        assert_eq!(decoded[0].headers().len(), 2);
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::default().with_max_length(32);
        let results = do_decode(
            b"MESSAGE\ncontent-length:100\n\n\0MESSAGE\n\n0123456789012345678901234567890123\0RECEIPT\n\n\0",
            &mut codec,
        );
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Err(Error::FrameTooLarge(32))));
        assert!(matches!(results[1], Err(Error::FrameTooLarge(32))));
        assert_eq!(results[2].as_ref().unwrap().command(), &Command::Receipt);
    }

    #[test]
    fn test_decode_eof_reports_partial_frame() {
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::from(&b"MESSAGE\ncontent-length:10\n\nabc"[..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut buffer),
            Err(Error::ContentLengthMismatch { declared: 10 })
        ));

        let mut buffer = BytesMut::from(&b"MESSAGE\nsubscr"[..]);
        assert!(matches!(
            codec.decode_eof(&mut buffer),
            Err(Error::MalformedFrame(_))
        ));

        let mut buffer = BytesMut::new();
        assert!(codec.decode_eof(&mut buffer).unwrap().is_none());
    }
}
