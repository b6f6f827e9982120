//! Control-channel messages exchanged between client and server.
//!
//! Framing is a 4-byte big-endian length prefix followed by a JSON body
//! with a `type` discriminator.
//!
//! Session flow:
//!
//! 1. Client connects the control channel and sends `Hello` with the test
//!    parameters and a fresh cookie.
//! 2. Server answers `Accept` (echoing the cookie) or `Reject`.
//! 3. TCP: the client opens the announced number of data connections, each
//!    introduced by a `Stream` preamble carrying the cookie. UDP: data
//!    flows as tagged datagrams to the server port.
//! 4. When the client's run ends it sends `Done`.
//! 5. The server replies `Summary` with its receive-side aggregate, which
//!    is how a sending client learns jitter and loss figures.

use crate::config::Protocol;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire-format version; bumped on breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a control message body, to reject garbage prefixes
/// before allocating.
const MAX_MESSAGE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Client handshake with the session parameters
    Hello {
        version: u32,
        cookie: String,
        protocol: Protocol,
        streams: usize,
        reverse: bool,
        duration_secs: u64,
        bandwidth: Option<u64>,
    },

    /// Server accepts the session
    Accept { cookie: String },

    /// Server declines the session
    Reject { reason: String },

    /// Preamble identifying a TCP data connection
    Stream { cookie: String, index: u32 },

    /// Client signals the end of its run
    Done,

    /// Server's receive-side aggregate for the session
    Summary {
        bytes: u64,
        bits_per_second: f64,
        jitter_ms: Option<f64>,
        lost_packets: Option<u64>,
        packets: Option<u64>,
    },
}

impl ControlMessage {
    pub fn hello(
        cookie: String,
        protocol: Protocol,
        streams: usize,
        reverse: bool,
        duration_secs: u64,
        bandwidth: Option<u64>,
    ) -> Self {
        ControlMessage::Hello {
            version: PROTOCOL_VERSION,
            cookie,
            protocol,
            streams,
            reverse,
            duration_secs,
            bandwidth,
        }
    }
}

/// Generates a session cookie: 32 hex characters.
pub fn new_cookie() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// Writes one length-prefixed message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ControlMessage,
) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed message.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ControlMessage> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "control message of {} bytes exceeds limit",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
