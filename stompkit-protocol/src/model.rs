/// Model definitions for values negotiated or exchanged in STOMP headers
use std::{fmt, str::FromStr, time::Duration};

use crate::Error;

/// Protocol version, ordered so that newer versions compare greater
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Version {
    V1_0,
    V1_1,
    V1_2,
}

impl Version {
    pub const ALL: [Version; 3] = [Version::V1_2, Version::V1_1, Version::V1_0];

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V1_0 => "1.0",
            Version::V1_1 => "1.1",
            Version::V1_2 => "1.2",
        }
    }

    /// Render an `accept-version` value, highest version first
    pub fn accept_list(versions: &[Version]) -> String {
        let mut sorted = versions.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted.dedup();
        sorted
            .iter()
            .map(Version::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::V1_2
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.0" => Ok(Version::V1_0),
            "1.1" => Ok(Version::V1_1),
            "1.2" => Ok(Version::V1_2),
            other => Err(Error::MalformedFrame(format!("unsupported version '{other}'"))),
        }
    }
}

/// Acknowledgement policy requested when subscribing
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(Error::MalformedFrame(format!("invalid ack mode '{other}'"))),
        }
    }
}

/// `heart-beat` header value: the sender's outgoing and desired incoming
/// intervals in milliseconds, 0 meaning "none"
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct HeartBeat {
    pub send_ms: u32,
    pub receive_ms: u32,
}

impl HeartBeat {
    pub fn new(send_ms: u32, receive_ms: u32) -> Self {
        Self {
            send_ms,
            receive_ms,
        }
    }

    /// Combine our (client) values with the server's `heart-beat` header.
    ///
    /// The result is from the client's point of view: `send_ms` is how often
    /// we must transmit, `receive_ms` how often the server will.
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> HeartBeat {
        let pick = |ours: u32, theirs: u32| {
            if ours == 0 || theirs == 0 {
                0
            } else {
                ours.max(theirs)
            }
        };
        HeartBeat {
            send_ms: pick(client.send_ms, server.receive_ms),
            receive_ms: pick(client.receive_ms, server.send_ms),
        }
    }

    pub fn send_interval(&self) -> Option<Duration> {
        (self.send_ms > 0).then(|| Duration::from_millis(u64::from(self.send_ms)))
    }

    pub fn receive_interval(&self) -> Option<Duration> {
        (self.receive_ms > 0).then(|| Duration::from_millis(u64::from(self.receive_ms)))
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

impl FromStr for HeartBeat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::MalformedFrame(format!("invalid heart-beat '{s}'"));
        let (send, receive) = s.trim().split_once(',').ok_or_else(invalid)?;
        Ok(HeartBeat {
            send_ms: send.trim().parse().map_err(|_| invalid())?,
            receive_ms: receive.trim().parse().map_err(|_| invalid())?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{AckMode, HeartBeat, Version};

    #[test]
    fn test_accept_list_is_highest_first() {
        let list = Version::accept_list(&[Version::V1_0, Version::V1_2, Version::V1_1]);
        assert_eq!(list, "1.2,1.1,1.0");
        assert_eq!(Version::accept_list(&[Version::V1_1]), "1.1");
    }

    #[test]
    fn test_parse_version() {
        assert_eq!("1.1".parse::<Version>().unwrap(), Version::V1_1);
        assert!("2.0".parse::<Version>().is_err());
    }

    #[test]
    fn test_ack_mode_text() {
        for mode in [AckMode::Auto, AckMode::Client, AckMode::ClientIndividual] {
            assert_eq!(mode.as_str().parse::<AckMode>().unwrap(), mode);
        }
        assert!("sometimes".parse::<AckMode>().is_err());
    }

    #[test]
    fn test_heart_beat_negotiation() {
        #[rustfmt::skip]
        let tests = vec![
            // client, server, expected
            ((0, 0), (1000, 1000), (0, 0)),
            ((1000, 0), (0, 500), (1000, 0)),
            ((1000, 0), (0, 5000), (5000, 0)),
            ((100, 200), (300, 50), (100, 300)),
            ((100, 200), (0, 0), (0, 0)),
        ];
        for (client, server, expected) in tests {
            let negotiated = HeartBeat::negotiate(
                HeartBeat::new(client.0, client.1),
                HeartBeat::new(server.0, server.1),
            );
            assert_eq!(negotiated, HeartBeat::new(expected.0, expected.1));
        }
    }

    #[test]
    fn test_parse_heart_beat() {
        assert_eq!("10, 20".parse::<HeartBeat>().unwrap(), HeartBeat::new(10, 20));
        assert_eq!(HeartBeat::new(10, 20).to_string(), "10,20");
        assert!("10".parse::<HeartBeat>().is_err());
        assert!("a,b".parse::<HeartBeat>().is_err());
    }
}
