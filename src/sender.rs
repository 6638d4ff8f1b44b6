//! Coordinator-side measurement engines.
//!
//! An engine is a pure state machine: it never touches a socket. The owning
//! session feeds it an explicit nanosecond timeline (`now_ns`) and performs
//! the I/O the engine asks for:
//! - [`on_tick`](Probe::on_tick) may hand back an encoded datagram to emit;
//! - [`on_datagram`](Probe::on_datagram) accounts a received reply;
//! - [`next_deadline_ns`](Probe::next_deadline_ns) tells the session when to
//!   tick next;
//! - [`is_complete`](Probe::is_complete) + [`finish`](Probe::finish) end the
//!   measurement and produce the [`NetStat`].
//!
//! Keeping state separate from I/O makes loss, reordering and timing fully
//! scriptable in tests.

use crate::command::{Command, TrafficParams};
use crate::packet::{DataHead, HEADER_LEN};
use crate::stats::NetStat;

const NS_PER_MS: i64 = 1_000_000;
const NS_PER_US: i64 = 1_000;
const SPEED_WINDOW_NS: i64 = 1_000_000_000;

/// Coordinator-side engine for one command; selection is a pure function of
/// the command variant.
#[derive(Debug)]
pub enum Probe {
    Echo(EchoSender),
    Bulk(BulkSender),
}

impl Probe {
    /// Build the sending engine for a measurement command.
    ///
    /// Returns `None` for control-only commands, which run no engine.
    pub fn for_command(command: &Command) -> Option<Probe> {
        match command {
            Command::Ping(p) => Some(Probe::Echo(EchoSender::new(p.clone()))),
            Command::Send(p) => Some(Probe::Bulk(BulkSender::new(p.clone()))),
            _ => None,
        }
    }

    pub fn start(&mut self, now_ns: i64) {
        match self {
            Probe::Echo(e) => e.start(now_ns),
            Probe::Bulk(b) => b.start(now_ns),
        }
    }

    pub fn next_deadline_ns(&self) -> Option<i64> {
        match self {
            Probe::Echo(e) => e.next_deadline_ns(),
            Probe::Bulk(b) => b.next_deadline_ns(),
        }
    }

    pub fn on_tick(&mut self, now_ns: i64) -> Option<Vec<u8>> {
        match self {
            Probe::Echo(e) => e.on_tick(now_ns),
            Probe::Bulk(b) => b.on_tick(now_ns),
        }
    }

    pub fn on_datagram(&mut self, now_ns: i64, buf: &[u8]) {
        match self {
            Probe::Echo(e) => e.on_datagram(now_ns, buf),
            Probe::Bulk(_) => {
                // a one-way send expects nothing back on the data channel
                log::debug!("[probe] dropping unexpected datagram ({} bytes)", buf.len());
            }
        }
    }

    pub fn is_complete(&self, now_ns: i64) -> bool {
        match self {
            Probe::Echo(e) => e.is_complete(now_ns),
            Probe::Bulk(b) => b.is_complete(now_ns),
        }
    }

    pub fn finish(&self) -> NetStat {
        match self {
            Probe::Echo(e) => e.finish(),
            Probe::Bulk(b) => b.finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// EchoSender
// ---------------------------------------------------------------------------

/// Round-trip probe sender.
///
/// Emits `count` stamped packets at `interval_us` spacing, then lingers
/// `wait_us` for stragglers. Every reply is classified exactly once:
/// foreign token → illegal, older than `timeout_ms` → timed out, otherwise a
/// delay sample.
#[derive(Debug)]
pub struct EchoSender {
    params: TrafficParams,
    send_packets: u64,
    recv_packets: u64,
    illegal_packets: u64,
    timeout_packets: u64,
    recv_bytes: u64,
    /// Σd and Σd² over the delay samples, for mean and standard deviation.
    delay_sum_ns: i64,
    delay_sq_sum: f64,
    min_delay_ns: Option<i64>,
    max_delay_ns: i64,
    start_ns: i64,
    next_send_ns: i64,
    last_send_ns: i64,
    last_recv_ns: i64,
}

impl EchoSender {
    pub fn new(params: TrafficParams) -> Self {
        Self {
            params,
            send_packets: 0,
            recv_packets: 0,
            illegal_packets: 0,
            timeout_packets: 0,
            recv_bytes: 0,
            delay_sum_ns: 0,
            delay_sq_sum: 0.0,
            min_delay_ns: None,
            max_delay_ns: 0,
            start_ns: 0,
            next_send_ns: 0,
            last_send_ns: 0,
            last_recv_ns: 0,
        }
    }

    pub fn start(&mut self, now_ns: i64) {
        self.start_ns = now_ns;
        self.next_send_ns = now_ns;
    }

    /// When the session should tick next: the pending emission, or the end of
    /// the linger window once everything is out.
    pub fn next_deadline_ns(&self) -> Option<i64> {
        if self.send_packets < self.params.count {
            Some(self.next_send_ns)
        } else {
            Some(self.last_send_ns + self.params.wait_us * NS_PER_US)
        }
    }

    /// Emit the next probe if its deadline has passed.
    pub fn on_tick(&mut self, now_ns: i64) -> Option<Vec<u8>> {
        if self.send_packets >= self.params.count || now_ns < self.next_send_ns {
            return None;
        }
        let head = DataHead {
            timestamp: now_ns,
            sequence: self.send_packets as u16,
            length: (self.params.size - HEADER_LEN) as u16,
            token: self.params.token,
        };
        self.send_packets += 1;
        self.last_send_ns = now_ns;
        self.next_send_ns = now_ns + self.params.interval_us * NS_PER_US;
        Some(head.encode())
    }

    /// Account one echoed reply.
    pub fn on_datagram(&mut self, now_ns: i64, buf: &[u8]) {
        let head = match DataHead::decode(buf) {
            Ok(head) => head,
            Err(e) => {
                log::debug!("[echo] undecodable reply: {e}");
                self.illegal_packets += 1;
                return;
            }
        };
        if head.token != self.params.token {
            self.illegal_packets += 1;
            return;
        }
        let delay_ns = now_ns - head.timestamp;
        if delay_ns > self.params.timeout_ms * NS_PER_MS {
            self.timeout_packets += 1;
            return;
        }
        self.recv_packets += 1;
        self.recv_bytes += buf.len() as u64;
        self.last_recv_ns = now_ns;
        self.delay_sum_ns += delay_ns;
        self.delay_sq_sum += (delay_ns as f64) * (delay_ns as f64);
        self.min_delay_ns = Some(self.min_delay_ns.map_or(delay_ns, |m| m.min(delay_ns)));
        self.max_delay_ns = self.max_delay_ns.max(delay_ns);
    }

    /// Every probe is out and the linger window has elapsed.
    pub fn is_complete(&self, now_ns: i64) -> bool {
        self.send_packets >= self.params.count
            && now_ns >= self.last_send_ns + self.params.wait_us * NS_PER_US
    }

    pub fn finish(&self) -> NetStat {
        let mut stat = NetStat {
            send_packets: self.send_packets as i64,
            recv_packets: self.recv_packets as i64,
            illegal_packets: self.illegal_packets as i64,
            timeout_packets: self.timeout_packets as i64,
            send_bytes: (self.send_packets * self.params.size as u64) as i64,
            recv_bytes: self.recv_bytes as i64,
            send_time: (self.last_send_ns - self.start_ns) / NS_PER_MS,
            ..Default::default()
        };
        if self.recv_packets > 0 {
            let n = self.recv_packets as f64;
            let mean_ns = self.delay_sum_ns as f64 / n;
            let var_ns2 = (self.delay_sq_sum / n - mean_ns * mean_ns).max(0.0);
            stat.delay = (mean_ns / NS_PER_MS as f64) as i64;
            stat.min_delay = self.min_delay_ns.unwrap_or(0) / NS_PER_MS;
            stat.max_delay = self.max_delay_ns / NS_PER_MS;
            stat.jitter = stat.max_delay - stat.min_delay;
            stat.jitter_std = (var_ns2.sqrt() / NS_PER_MS as f64) as i64;
            stat.recv_time = (self.last_recv_ns - self.start_ns) / NS_PER_MS;
        }
        if self.send_packets > 0 {
            let lost = self.send_packets.saturating_sub(self.recv_packets) as f64;
            stat.loss = (lost / self.send_packets as f64).clamp(0.0, 1.0);
        }
        stat
    }
}

// ---------------------------------------------------------------------------
// BulkSender
// ---------------------------------------------------------------------------

/// One-way bulk sender.
///
/// Emits sequences `0..count-1` exactly once, in order, accounting bytes,
/// packet rate and min/max speed over one-second windows.
#[derive(Debug)]
pub struct BulkSender {
    params: TrafficParams,
    send_packets: u64,
    send_bytes: u64,
    start_ns: i64,
    next_send_ns: i64,
    last_send_ns: i64,
    window_start_ns: i64,
    window_bytes: u64,
    min_speed: Option<i64>,
    max_speed: i64,
}

impl BulkSender {
    pub fn new(params: TrafficParams) -> Self {
        Self {
            params,
            send_packets: 0,
            send_bytes: 0,
            start_ns: 0,
            next_send_ns: 0,
            last_send_ns: 0,
            window_start_ns: 0,
            window_bytes: 0,
            min_speed: None,
            max_speed: 0,
        }
    }

    pub fn start(&mut self, now_ns: i64) {
        self.start_ns = now_ns;
        self.next_send_ns = now_ns;
        self.window_start_ns = now_ns;
    }

    pub fn next_deadline_ns(&self) -> Option<i64> {
        if self.send_packets < self.params.count {
            Some(self.next_send_ns)
        } else {
            Some(self.last_send_ns + self.params.wait_us * NS_PER_US)
        }
    }

    /// Emit the next packet if due. With a zero interval the session drains
    /// the whole burst by calling this in a loop.
    pub fn on_tick(&mut self, now_ns: i64) -> Option<Vec<u8>> {
        if self.send_packets >= self.params.count || now_ns < self.next_send_ns {
            return None;
        }
        let head = DataHead {
            timestamp: now_ns,
            sequence: self.send_packets as u16,
            length: (self.params.size - HEADER_LEN) as u16,
            token: self.params.token,
        };
        self.send_packets += 1;
        self.send_bytes += self.params.size as u64;
        self.last_send_ns = now_ns;
        self.next_send_ns = now_ns + self.params.interval_us * NS_PER_US;

        self.window_bytes += self.params.size as u64;
        let elapsed = now_ns - self.window_start_ns;
        if elapsed >= SPEED_WINDOW_NS {
            let speed = (self.window_bytes as f64 / (elapsed as f64 / 1e9)) as i64;
            self.min_speed = Some(self.min_speed.map_or(speed, |m| m.min(speed)));
            self.max_speed = self.max_speed.max(speed);
            self.window_start_ns = now_ns;
            self.window_bytes = 0;
        }
        Some(head.encode())
    }

    pub fn is_complete(&self, now_ns: i64) -> bool {
        self.send_packets >= self.params.count
            && now_ns >= self.last_send_ns + self.params.wait_us * NS_PER_US
    }

    pub fn finish(&self) -> NetStat {
        let mut stat = NetStat {
            send_packets: self.send_packets as i64,
            send_bytes: self.send_bytes as i64,
            min_send_speed: self.min_speed.unwrap_or(0),
            max_send_speed: self.max_speed,
            ..Default::default()
        };
        let elapsed_ns = self.last_send_ns - self.start_ns;
        if elapsed_ns >= NS_PER_MS {
            let secs = elapsed_ns as f64 / 1e9;
            stat.send_time = elapsed_ns / NS_PER_MS;
            stat.send_speed = (self.send_bytes as f64 / secs) as i64;
            stat.send_pps = (self.send_packets as f64 / secs) as i64;
        }
        stat
    }
}
