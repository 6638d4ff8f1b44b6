//! Control-line framing over TCP and data-socket helpers.
//!
//! [`ControlChannel`] is a thin wrapper around a `tokio::net::TcpStream`
//! that speaks typed [`Command`]s instead of raw bytes: one newline-framed
//! ASCII line per command, at most [`MAX_LINE_LEN`] bytes before the
//! terminator. All protocol logic lives elsewhere; this module owns only
//! byte I/O and the socket setup for the unreliable data channel.

use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};

use crate::command::{parse_command, Command, CommandError, MAX_LINE_LEN};
use crate::DATA_MULTICAST_GROUP;

/// Errors that can arise on either channel of a session.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Underlying I/O error from the OS.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer closed the control connection.
    #[error("control channel closed by peer")]
    Closed,
    /// The peer sent a line that does not parse as a command.
    #[error("bad control line: {0}")]
    Command(#[from] CommandError),
}

// ---------------------------------------------------------------------------
// ControlChannel
// ---------------------------------------------------------------------------

/// A typed, line-framed view of one control connection.
pub struct ControlChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Peer address, kept for the log cookie.
    pub peer_addr: SocketAddr,
    line: String,
}

impl ControlChannel {
    pub fn new(stream: TcpStream) -> Result<Self, ChannelError> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer_addr,
            line: String::new(),
        })
    }

    /// Read and parse the next command line.
    ///
    /// Returns [`ChannelError::Closed`] on a clean EOF. The read is capped
    /// just past [`MAX_LINE_LEN`] so a peer that never sends a newline
    /// cannot grow the buffer; an over-long line reads as `TooLong`.
    pub async fn read_command(&mut self) -> Result<Command, ChannelError> {
        self.line.clear();
        let mut capped = (&mut self.reader).take(MAX_LINE_LEN as u64 + 2);
        let n = capped.read_line(&mut self.line).await?;
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        let trimmed = self.line.trim_end_matches(['\r', '\n']);
        if trimmed.len() > MAX_LINE_LEN {
            return Err(ChannelError::Command(CommandError::TooLong(trimmed.len())));
        }
        Ok(parse_command(trimmed)?)
    }

    /// Serialise and send one command line.
    pub async fn write_command(&mut self, command: &Command) -> Result<(), ChannelError> {
        let mut line = command.to_string();
        log::trace!("[ctrl] → {line}");
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Data sockets
// ---------------------------------------------------------------------------

/// Bind a fresh unicast data socket on an OS-assigned port.
pub async fn bind_data_socket() -> std::io::Result<UdpSocket> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await
}

/// Bind the agent-side multicast data socket: listens on `port` and joins
/// the data group on the default interface.
pub async fn bind_multicast_listener(port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    socket.join_multicast_v4(DATA_MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

/// Where multicast data packets are addressed.
pub fn multicast_target(port: u16) -> SocketAddr {
    SocketAddr::from((DATA_MULTICAST_GROUP, port))
}
