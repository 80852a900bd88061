/// Session configuration
use std::time::Duration;

use stompkit_protocol::{header, Command, Frame, HeartBeat, Version, MAX_LENGTH};

pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_DELIVERY_CAPACITY: usize = 1024;

/// What happens to a MESSAGE when the handler queue is full
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Wait for space, which stalls decoding until a handler catches up
    Block,
    /// Drop the message, log a warning and count it in `dropped_deliveries`
    #[default]
    DropNewest,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Value of the `host` header, usually the broker's virtual host
    pub host: String,
    pub accept_versions: Vec<Version>,
    /// Heart-beat intervals we offer, in milliseconds
    pub heart_beat: HeartBeat,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// How long `disconnect` waits for the broker's RECEIPT
    pub receipt_timeout: Duration,
    /// Bound on channel events waiting for the reader
    pub event_capacity: usize,
    /// Bound on callbacks waiting for the dispatcher
    pub delivery_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_frame_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            accept_versions: Version::ALL.to_vec(),
            heart_beat: HeartBeat::default(),
            login: None,
            passcode: None,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            max_frame_length: MAX_LENGTH,
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_versions(mut self, versions: impl IntoIterator<Item = Version>) -> Self {
        self.accept_versions = versions.into_iter().collect();
        self
    }

    pub fn with_heart_beat(mut self, send_ms: u32, receive_ms: u32) -> Self {
        self.heart_beat = HeartBeat::new(send_ms, receive_ms);
        self
    }

    pub fn with_credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_delivery_capacity(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.delivery_capacity = capacity;
        self.overflow_policy = policy;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub(crate) fn offers(&self, version: Version) -> bool {
        self.accept_versions.contains(&version)
    }

    pub(crate) fn connect_frame(&self) -> Frame {
        let mut frame = Frame::new(Command::Connect)
            .header(header::ACCEPT_VERSION, Version::accept_list(&self.accept_versions))
            .header(header::HOST, &self.host);
        if self.heart_beat != HeartBeat::default() {
            frame = frame.header(header::HEART_BEAT, self.heart_beat.to_string());
        }
        if let Some(login) = &self.login {
            frame = frame.header(header::LOGIN, login);
        }
        if let Some(passcode) = &self.passcode {
            frame = frame.header(header::PASSCODE, passcode);
        }
        frame
    }
}

#[cfg(test)]
mod test {
    use super::SessionConfig;
    use stompkit_protocol::{Command, Version};

    #[test]
    fn test_connect_frame() {
        let frame = SessionConfig::new("broker")
            .with_versions([Version::V1_1, Version::V1_2])
            .with_heart_beat(1000, 2000)
            .with_credentials("guest", "secret")
            .connect_frame();
        assert_eq!(frame.command(), &Command::Connect);
        assert_eq!(frame.get("accept-version"), Some("1.2,1.1"));
        assert_eq!(frame.get("host"), Some("broker"));
        assert_eq!(frame.get("heart-beat"), Some("1000,2000"));
        assert_eq!(frame.get("login"), Some("guest"));
        assert_eq!(frame.get("passcode"), Some("secret"));
    }

    #[test]
    fn test_default_connect_frame_is_minimal() {
        let frame = SessionConfig::default().connect_frame();
        assert_eq!(frame.get("accept-version"), Some("1.2,1.1,1.0"));
        assert_eq!(frame.get("host"), Some("localhost"));
        assert!(!frame.contains("heart-beat"));
        assert!(!frame.contains("login"));
    }
}
