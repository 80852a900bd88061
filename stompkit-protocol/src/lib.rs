/// Protocol definitions for STOMP clients
///
/// Implements the frame layer of STOMP 1.0, 1.1 and 1.2. A frame on the wire
/// looks like:
///
/// ```ignore
/// COMMAND
/// key:value
/// key:value
///
/// body^@
/// ```
///
/// Where `^@` is a NUL byte. A lone newline between frames is a heart-beat.
use thiserror::Error;

mod codec;
mod frame;
pub mod header;
mod model;
mod util;

pub use codec::{FrameCodec, HEARTBEAT, MAX_LENGTH};
pub use frame::{Command, Frame};
pub use header::Header;
pub use model::{AckMode, HeartBeat, Version};

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("content-length mismatch: declared {declared} bytes")]
    ContentLengthMismatch { declared: usize },

    #[error("unknown command: {}", .0.command())]
    UnknownCommand(Box<Frame>),

    #[error("frame exceeds maximum length of {0} bytes")]
    FrameTooLarge(usize),
}
