//! Control-line command registry, parser and formatter.
//!
//! A control-channel command is one ASCII line:
//! `<name> [<key> <value>]* [<flag>]*` — a flag is a key with no value whose
//! presence alone is truthy (e.g. `multicast`). This module is responsible
//! for:
//! - the fixed, process-wide registry of command names;
//! - parsing a line into a typed [`Command`], rejecting oversized lines,
//!   unknown names, duplicate keys and malformed values;
//! - deriving measurement parameters (`count`, `interval`) from
//!   `speed`/`time` style arguments;
//! - formatting a typed command back into its wire line.
//!
//! Surface units are milliseconds (fractions allowed for `interval`/`wait`),
//! kilobytes per second and bytes; intervals are microseconds internally.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::packet::HEADER_LEN;
use crate::stats::NetStat;

/// Longest accepted command line, excluding the newline.
pub const MAX_LINE_LEN: usize = 1014;

/// Alphabet the per-command tokens are drawn from, round-robin.
const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

static TOKEN_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Next token in the round-robin rotation.
///
/// Tokens disambiguate which in-flight command a data packet belongs to;
/// a stale datagram carrying an older token is counted as illegal.
pub fn next_token() -> u8 {
    let i = TOKEN_CURSOR.fetch_add(1, Ordering::Relaxed);
    TOKEN_ALPHABET[i % TOKEN_ALPHABET.len()]
}

// ---------------------------------------------------------------------------
// Typed commands
// ---------------------------------------------------------------------------

/// Parameters shared by the two measurement commands.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficParams {
    /// Number of data packets to emit.
    pub count: u64,
    /// Spacing between emissions, microseconds.
    pub interval_us: i64,
    /// Full datagram size in bytes (header + padding).
    pub size: usize,
    /// How long to linger for stragglers after the last emission, microseconds.
    pub wait_us: i64,
    /// Staleness limit for received packets and the session handshake
    /// deadline, milliseconds.
    pub timeout_ms: i64,
    /// Token stamped into every data packet of this command.
    pub token: u8,
    /// Send to the multicast group instead of the peer's unicast address.
    pub multicast: bool,
}

/// Data-channel flavour negotiated ahead of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Udp,
    Multicast,
}

/// One parsed control-channel command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Round-trip probe; the agent echoes every data packet back.
    Ping(TrafficParams),
    /// One-way bulk send; the agent only receives and accounts.
    Send(TrafficParams),
    /// Data-channel negotiation: which flavour, and the sender's data port.
    Mode { mode: ChannelMode, port: u16 },
    /// Agent acknowledgement of a measurement command.
    Ack,
    /// Coordinator signal that the measurement is over.
    Stop,
    /// Agent statistics report.
    Result(NetStat),
}

impl Command {
    /// Wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping(_) => "ping",
            Command::Send(_) => "send",
            Command::Mode { .. } => "mode",
            Command::Ack => "ack",
            Command::Stop => "stop",
            Command::Result(_) => "result",
        }
    }

    /// The traffic parameters, when this is a measurement command.
    pub fn traffic(&self) -> Option<&TrafficParams> {
        match self {
            Command::Ping(p) | Command::Send(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    /// Render the wire line for this command (no trailing newline).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ping(p) => write!(f, "ping {p}"),
            Command::Send(p) if p.multicast => write!(f, "send {p} multicast"),
            Command::Send(p) => write!(f, "send {p}"),
            // the port rides as the flag's value: the parser pairs words
            // strictly, so a bare flag can only sit in trailing position
            Command::Mode { mode: ChannelMode::Udp, port } => write!(f, "mode udp {port}"),
            Command::Mode { mode: ChannelMode::Multicast, port } => {
                write!(f, "mode multicast {port}")
            }
            Command::Ack => f.write_str("ack"),
            Command::Stop => f.write_str("stop"),
            Command::Result(stat) => {
                let args = stat.to_args();
                if args.is_empty() {
                    f.write_str("result")
                } else {
                    write!(f, "result {args}")
                }
            }
        }
    }
}

impl fmt::Display for TrafficParams {
    /// Render the resolved parameters. `time 0` pins the literal `count` and
    /// `interval`: without it a re-parse would re-derive `count` from the
    /// default duration and the two ends would disagree.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count {} interval {} size {} wait {} timeout {} time 0 token {}",
            self.count,
            self.interval_us as f64 / 1000.0,
            self.size,
            self.wait_us as f64 / 1000.0,
            self.timeout_ms,
            self.token as char,
        )
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command line too long ({0} bytes, limit {MAX_LINE_LEN})")]
    TooLong(usize),
    #[error("empty command line")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("bad value for {key}: {value:?}")]
    BadValue { key: &'static str, value: String },
    #[error("count resolves to zero")]
    ZeroCount,
    #[error("size {0} smaller than the {HEADER_LEN}-byte header")]
    SizeTooSmall(usize),
    #[error("mode requires a udp or multicast flag")]
    BadMode,
}

// ---------------------------------------------------------------------------
// Registry & parser
// ---------------------------------------------------------------------------

type ArgMap = HashMap<String, String>;
type Builder = fn(&ArgMap) -> Result<Command, CommandError>;

/// The process-wide command registry: a fixed bootstrapping list, not
/// runtime side-effect registration.
pub const REGISTRY: &[(&str, Builder)] = &[
    ("ping", build_ping),
    ("send", build_send),
    ("mode", build_mode),
    ("ack", build_ack),
    ("stop", build_stop),
    ("result", build_result),
];

/// Parse one control line into a typed [`Command`].
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() > MAX_LINE_LEN {
        return Err(CommandError::TooLong(line.len()));
    }
    let mut words = line.split_whitespace();
    let name = words.next().ok_or(CommandError::Empty)?;
    let builder = REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, b)| *b)
        .ok_or_else(|| CommandError::Unknown(name.to_string()))?;

    let mut args = ArgMap::new();
    let mut words = words.peekable();
    while let Some(key) = words.next() {
        // A trailing key with no value is a flag; its empty value is truthy.
        let value = words.next().unwrap_or_default();
        if args.insert(key.to_string(), value.to_string()).is_some() {
            return Err(CommandError::DuplicateKey(key.to_string()));
        }
    }
    builder(&args)
}

fn build_ack(_args: &ArgMap) -> Result<Command, CommandError> {
    Ok(Command::Ack)
}

fn build_stop(_args: &ArgMap) -> Result<Command, CommandError> {
    Ok(Command::Stop)
}

fn build_result(args: &ArgMap) -> Result<Command, CommandError> {
    Ok(Command::Result(NetStat::from_args(args)))
}

fn build_mode(args: &ArgMap) -> Result<Command, CommandError> {
    let (mode, value) = if let Some(v) = args.get("udp") {
        (ChannelMode::Udp, v)
    } else if let Some(v) = args.get("multicast") {
        (ChannelMode::Multicast, v)
    } else {
        return Err(CommandError::BadMode);
    };
    let port = value
        .parse()
        .map_err(|_| CommandError::BadValue { key: "port", value: value.clone() })?;
    Ok(Command::Mode { mode, port })
}

fn build_ping(args: &ArgMap) -> Result<Command, CommandError> {
    let params = resolve_traffic(args, &PING_DEFAULTS)?;
    Ok(Command::Ping(params))
}

fn build_send(args: &ArgMap) -> Result<Command, CommandError> {
    let mut params = resolve_traffic(args, &SEND_DEFAULTS)?;
    params.multicast = args.contains_key("multicast");
    Ok(Command::Send(params))
}

// ---------------------------------------------------------------------------
// Parameter resolution
// ---------------------------------------------------------------------------

struct TrafficDefaults {
    count: u64,
    interval_ms: f64,
    size: usize,
    wait_ms: f64,
    timeout_ms: i64,
    time_ms: i64,
    /// A ping with `speed`+`time` and the default size widens to a full
    /// Ethernet payload first.
    widen_default_size: bool,
    /// Echo pacing cannot be zero.
    min_interval_ms: Option<f64>,
}

const PING_DEFAULTS: TrafficDefaults = TrafficDefaults {
    count: 5,
    interval_ms: 200.0,
    size: 32,
    wait_ms: 500.0,
    timeout_ms: 100,
    time_ms: 0,
    widen_default_size: true,
    min_interval_ms: Some(200.0),
};

const SEND_DEFAULTS: TrafficDefaults = TrafficDefaults {
    count: 100,
    interval_ms: 0.0,
    size: 1472,
    wait_ms: 500.0,
    timeout_ms: 100,
    time_ms: 3000,
    widen_default_size: false,
    min_interval_ms: None,
};

/// Parse `key` as a number; an absent key or empty (flag) value means
/// `default`.
fn number<T: std::str::FromStr + Copy>(
    args: &ArgMap,
    key: &'static str,
    default: T,
) -> Result<T, CommandError> {
    match args.get(key).map(String::as_str) {
        None | Some("") => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| CommandError::BadValue { key, value: v.to_string() }),
    }
}

fn resolve_traffic(args: &ArgMap, d: &TrafficDefaults) -> Result<TrafficParams, CommandError> {
    let mut count = number(args, "count", d.count)?;
    let mut interval_us = (number(args, "interval", d.interval_ms)? * 1000.0) as i64;
    let mut size = number(args, "size", d.size)?;
    let wait_us = (number(args, "wait", d.wait_ms)? * 1000.0) as i64;
    let timeout_ms = number(args, "timeout", d.timeout_ms)?;
    let token = match args.get("token").map(String::as_str) {
        None | Some("") => next_token(),
        Some(v) => v.as_bytes()[0],
    };

    let speed = number(args, "speed", 0i64)?; // KB/s
    let time = number(args, "time", d.time_ms)?; // ms
    if speed > 0 && time > 0 {
        if d.widen_default_size && size == d.size {
            size = 1472;
        }
        let bytes_per_sec = speed as f64 * 1024.0;
        count = (bytes_per_sec * (time as f64 / 1000.0) / size as f64).ceil() as u64;
        interval_us = (1_000_000.0 / (bytes_per_sec / size as f64)) as i64;
    } else if interval_us > 0 && time > 0 {
        count = (time * 1000 / interval_us) as u64;
    }
    if let Some(min_ms) = d.min_interval_ms {
        if interval_us <= 0 {
            interval_us = (min_ms * 1000.0) as i64;
        }
    }

    if count == 0 {
        return Err(CommandError::ZeroCount);
    }
    if size < HEADER_LEN {
        return Err(CommandError::SizeTooSmall(size));
    }
    Ok(TrafficParams { count, interval_us, size, wait_us, timeout_ms, token, multicast: false })
}
