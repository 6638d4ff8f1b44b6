//! `netsnoop` — a distributed network-measurement harness.
//!
//! One coordinator ("server") accepts control connections from any number of
//! measurement agents ("clients") and drives them through short traffic
//! experiments — round-trip probes and one-way bulk sends — collecting
//! per-peer delay, jitter, loss, reorder and throughput statistics.
//!
//! # Architecture
//!
//! ```text
//!  console ──commands──▶ ┌──────────┐   control lines (TCP)   ┌──────────┐
//!                        │  Server  │◀───────────────────────▶│  Client  │
//!                        └────┬─────┘                         └────┬─────┘
//!                             │ one task per peer                  │
//!                        ┌────▼─────┐    data packets (UDP /  ┌────▼─────┐
//!                        │   Peer   │───── multicast) ───────▶│ engines  │
//!                        │ (session)│◀────────────────────────│ (recv)   │
//!                        └────┬─────┘                         └──────────┘
//!                             │ owns
//!                        ┌────▼─────┐
//!                        │ engines  │  (echo probe / bulk send)
//!                        └──────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]   — data-packet wire format (serialise / deserialise)
//! - [`command`]  — control-line registry, parser and parameter derivation
//! - [`stats`]    — the [`stats::NetStat`] record and its aggregation operators
//! - [`state`]    — session finite-state-machine types
//! - [`sender`]   — coordinator-side measurement engines
//! - [`receiver`] — agent-side measurement engines
//! - [`socket`]   — control-line framing and data-socket helpers
//! - [`peer`]     — coordinator-side per-peer session task
//! - [`server`]   — listener, command fan-out, result aggregation, beacon
//! - [`client`]   — agent process loop

pub mod client;
pub mod command;
pub mod packet;
pub mod peer;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod socket;
pub mod state;
pub mod stats;

pub use command::{parse_command, Command, TrafficParams};
pub use packet::DataHead;
pub use stats::NetStat;

/// Multicast group data packets are sent to during a multicast `send`.
pub const DATA_MULTICAST_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(239, 3, 3, 3);

/// Group port for multicast data; announced in the `mode multicast` line.
pub const DATA_MULTICAST_PORT: u16 = 4002;

/// Multicast group + port the coordinator announces itself on.
pub const NOTIFY_MULTICAST_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(239, 3, 3, 4);
pub const NOTIFY_PORT: u16 = 4001;

/// Cadence of the discovery beacon.
pub const NOTIFY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);

/// Nanoseconds since the UNIX epoch, as stamped into data packets.
///
/// Both ends of an echo round trip read this on the same host, so the epoch
/// choice only matters for one-way staleness checks, which assume roughly
/// synchronised wall clocks.
pub fn wall_now_ns() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(_) => 0,
    }
}
