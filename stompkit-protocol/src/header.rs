//! Header vocabulary and version-dependent escaping of header text.
use std::fmt;

use crate::{Error, Version};

pub const ACCEPT_VERSION: &str = "accept-version";
pub const HEART_BEAT: &str = "heart-beat";
pub const VERSION: &str = "version";
pub const HOST: &str = "host";
pub const CONTENT_TYPE: &str = "content-type";
pub const CONTENT_LENGTH: &str = "content-length";
pub const ID: &str = "id";
pub const DESTINATION: &str = "destination";
pub const ACK: &str = "ack";
pub const TRANSACTION: &str = "transaction";
pub const RECEIPT: &str = "receipt";
pub const RECEIPT_ID: &str = "receipt-id";
pub const SUBSCRIPTION: &str = "subscription";
pub const MESSAGE_ID: &str = "message-id";
pub const LOGIN: &str = "login";
pub const PASSCODE: &str = "passcode";
pub const MESSAGE: &str = "message";
pub const SERVER: &str = "server";
pub const SESSION: &str = "session";

/// A single `key:value` header, stored unescaped
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> From<(K, V)> for Header {
    fn from(value: (K, V)) -> Self {
        let (key, value) = value;
        Header::new(key, value)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Append `text` to `dst`, escaping the octets the given version reserves.
/// Version 1.0 has no escaping at all.
pub fn escape_into(text: &str, version: Version, dst: &mut Vec<u8>) {
    if version == Version::V1_0 {
        dst.extend_from_slice(text.as_bytes());
        return;
    }
    for &b in text.as_bytes() {
        match b {
            b'\\' => dst.extend_from_slice(b"\\\\"),
            b'\n' => dst.extend_from_slice(b"\\n"),
            b':' => dst.extend_from_slice(b"\\c"),
            b'\r' if version == Version::V1_2 => dst.extend_from_slice(b"\\r"),
            b => dst.push(b),
        }
    }
}

/// Reverse [`escape_into`]. An undefined escape sequence is an error in 1.1+.
pub fn unescape(raw: &[u8], version: Version) -> Result<String, Error> {
    if version == Version::V1_0 {
        return String::from_utf8(raw.to_vec())
            .map_err(|_| Error::MalformedFrame("header is not utf-8".into()));
    }
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'c') => out.push(b':'),
            Some(b'r') if version == Version::V1_2 => out.push(b'\r'),
            Some(other) => {
                return Err(Error::MalformedFrame(format!(
                    "undefined escape sequence '\\{}'",
                    char::from(*other)
                )))
            }
            None => return Err(Error::MalformedFrame("dangling escape at end of header".into())),
        }
    }
    String::from_utf8(out).map_err(|_| Error::MalformedFrame("header is not utf-8".into()))
}

#[cfg(test)]
mod test {
    use super::{escape_into, unescape};
    use crate::Version;

    fn escaped(text: &str, version: Version) -> String {
        let mut out = Vec::new();
        escape_into(text, version, &mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_escape_per_version() {
        let raw = "a:b\\c\nd\re";
        assert_eq!(escaped(raw, Version::V1_0), raw);
        assert_eq!(escaped(raw, Version::V1_1), "a\\cb\\\\c\\nd\re");
        assert_eq!(escaped(raw, Version::V1_2), "a\\cb\\\\c\\nd\\re");
    }

    #[test]
    fn test_unescape_reverses_escape() {
        let raw = "key:with\\odd\nbits";
        for version in [Version::V1_1, Version::V1_2] {
            let text = escaped(raw, version);
            assert_eq!(unescape(text.as_bytes(), version).unwrap(), raw);
        }
    }

    #[test]
    fn test_unescape_rejects_undefined_sequences() {
        assert!(unescape(b"tab\\there", Version::V1_2).is_err());
        assert!(unescape(b"cr\\r", Version::V1_1).is_err());
        assert!(unescape(b"trailing\\", Version::V1_2).is_err());
        assert_eq!(unescape(b"tab\\there", Version::V1_0).unwrap(), "tab\\there");
    }
}
