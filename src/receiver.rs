//! Agent-side measurement engines.
//!
//! Mirrors of [`crate::sender`]: pure state machines fed an explicit
//! nanosecond timeline, with all socket I/O left to the owning session.
//! - [`EchoResponder`] queues every received datagram and hands it back for
//!   re-emission, so timestamp, sequence and token survive the round trip.
//! - [`BulkReceiver`] classifies each datagram exactly once (illegal, timed
//!   out, or received — with duplicate/reorder sub-classification against a
//!   watermark and a 64-entry recent-sequence bitset) and accounts
//!   throughput over one-second windows.

use std::collections::VecDeque;

use crate::command::{Command, TrafficParams};
use crate::packet::DataHead;
use crate::stats::NetStat;

const NS_PER_MS: i64 = 1_000_000;
const SPEED_WINDOW_NS: i64 = 1_000_000_000;

/// Replies the responder will buffer before shedding load.
const ECHO_QUEUE_CAP: usize = 1024;

/// Agent-side engine for one command; selection is a pure function of the
/// command variant.
#[derive(Debug)]
pub enum Collector {
    Echo(EchoResponder),
    Bulk(BulkReceiver),
}

impl Collector {
    /// Build the receiving engine for a measurement command.
    pub fn for_command(command: &Command) -> Option<Collector> {
        match command {
            Command::Ping(p) => Some(Collector::Echo(EchoResponder::new(p.clone()))),
            Command::Send(p) => Some(Collector::Bulk(BulkReceiver::new(p.clone()))),
            _ => None,
        }
    }

    pub fn start(&mut self, now_ns: i64) {
        match self {
            Collector::Echo(_) => {}
            Collector::Bulk(b) => b.start(now_ns),
        }
    }

    pub fn on_datagram(&mut self, now_ns: i64, buf: &[u8]) {
        match self {
            Collector::Echo(e) => e.on_datagram(buf),
            Collector::Bulk(b) => b.on_datagram(now_ns, buf),
        }
    }

    /// Next buffered echo to put back on the wire, if any.
    pub fn pop_echo(&mut self) -> Option<Vec<u8>> {
        match self {
            Collector::Echo(e) => e.pop_echo(),
            Collector::Bulk(_) => None,
        }
    }

    pub fn finish(&mut self) -> NetStat {
        match self {
            Collector::Echo(e) => e.finish(),
            Collector::Bulk(b) => b.finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// EchoResponder
// ---------------------------------------------------------------------------

/// Echo half of the round-trip probe.
///
/// Every datagram is queued verbatim and echoed back unchanged; the probe
/// sender does all classification. The queue is bounded: overflow sheds the
/// newest datagram (it still counts as received).
#[derive(Debug)]
pub struct EchoResponder {
    recv_packets: u64,
    send_packets: u64,
    shed_packets: u64,
    queue: VecDeque<Vec<u8>>,
}

impl EchoResponder {
    pub fn new(_params: TrafficParams) -> Self {
        Self {
            recv_packets: 0,
            send_packets: 0,
            shed_packets: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn on_datagram(&mut self, buf: &[u8]) {
        self.recv_packets += 1;
        if self.queue.len() >= ECHO_QUEUE_CAP {
            self.shed_packets += 1;
            return;
        }
        self.queue.push_back(buf.to_vec());
    }

    /// Take the oldest buffered datagram for re-emission.
    pub fn pop_echo(&mut self) -> Option<Vec<u8>> {
        let buf = self.queue.pop_front()?;
        self.send_packets += 1;
        Some(buf)
    }

    /// Close out the measurement. Residual queued data means the stop raced
    /// ahead of the echo stream.
    pub fn finish(&mut self) -> NetStat {
        if !self.queue.is_empty() {
            log::warn!("[echo] stop with {} replies still queued", self.queue.len());
            debug_assert!(self.queue.is_empty(), "echo queue drained before stop");
        }
        if self.shed_packets > 0 {
            log::warn!("[echo] queue overflow shed {} datagrams", self.shed_packets);
        }
        NetStat {
            recv_packets: self.recv_packets as i64,
            send_packets: self.send_packets as i64,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// BulkReceiver
// ---------------------------------------------------------------------------

/// Receive half of the one-way bulk measurement.
#[derive(Debug)]
pub struct BulkReceiver {
    params: TrafficParams,
    recv_packets: u64,
    recv_bytes: u64,
    illegal_packets: u64,
    timeout_packets: u64,
    reorder_packets: u64,
    duplicate_packets: u64,
    /// Highest sequence accepted so far.
    watermark: Option<u16>,
    /// Bit `i` set ⇒ sequence `watermark − i` has been seen.
    seen: u64,
    start_ns: i64,
    last_recv_ns: i64,
    window_start_ns: i64,
    window_bytes: u64,
    min_speed: Option<i64>,
    max_speed: i64,
}

impl BulkReceiver {
    pub fn new(params: TrafficParams) -> Self {
        Self {
            params,
            recv_packets: 0,
            recv_bytes: 0,
            illegal_packets: 0,
            timeout_packets: 0,
            reorder_packets: 0,
            duplicate_packets: 0,
            watermark: None,
            seen: 0,
            start_ns: 0,
            last_recv_ns: 0,
            window_start_ns: 0,
            window_bytes: 0,
            min_speed: None,
            max_speed: 0,
        }
    }

    pub fn start(&mut self, now_ns: i64) {
        self.start_ns = now_ns;
        self.window_start_ns = now_ns;
    }

    /// Classify and account one datagram.
    pub fn on_datagram(&mut self, now_ns: i64, buf: &[u8]) {
        let head = match DataHead::decode(buf) {
            Ok(head) => head,
            Err(e) => {
                log::debug!("[bulk] undecodable datagram: {e}");
                self.illegal_packets += 1;
                return;
            }
        };
        if head.token != self.params.token {
            self.illegal_packets += 1;
            return;
        }
        if now_ns - head.timestamp > self.params.timeout_ms * NS_PER_MS {
            self.timeout_packets += 1;
            return;
        }

        self.classify_sequence(head.sequence);
        self.recv_packets += 1;
        self.recv_bytes += buf.len() as u64;
        self.last_recv_ns = now_ns;

        self.window_bytes += buf.len() as u64;
        let elapsed = now_ns - self.window_start_ns;
        if elapsed >= SPEED_WINDOW_NS {
            let speed = (self.window_bytes as f64 / (elapsed as f64 / 1e9)) as i64;
            self.min_speed = Some(self.min_speed.map_or(speed, |m| m.min(speed)));
            self.max_speed = self.max_speed.max(speed);
            self.window_start_ns = now_ns;
            self.window_bytes = 0;
        }
    }

    /// Duplicate/reorder detection against the watermark and the recent
    /// bitset. Comparisons are wrap-safe: two sequence numbers are "close"
    /// when their distance is under half the u16 space.
    fn classify_sequence(&mut self, seq: u16) {
        let Some(h) = self.watermark else {
            self.watermark = Some(seq);
            self.seen = 1;
            return;
        };
        let ahead = seq.wrapping_sub(h);
        if ahead != 0 && ahead <= u16::MAX / 2 {
            // newer than anything seen: slide the window forward
            self.seen = if ahead as u32 >= u64::BITS { 0 } else { self.seen << ahead };
            self.seen |= 1;
            self.watermark = Some(seq);
        } else {
            let behind = h.wrapping_sub(seq) as u32;
            if behind < u64::BITS && self.seen & (1u64 << behind) != 0 {
                self.duplicate_packets += 1;
            } else {
                self.reorder_packets += 1;
                if behind < u64::BITS {
                    self.seen |= 1u64 << behind;
                }
            }
        }
    }

    pub fn finish(&mut self) -> NetStat {
        let mut stat = NetStat {
            recv_packets: self.recv_packets as i64,
            recv_bytes: self.recv_bytes as i64,
            illegal_packets: self.illegal_packets as i64,
            timeout_packets: self.timeout_packets as i64,
            reorder_packets: self.reorder_packets as i64,
            duplicate_packets: self.duplicate_packets as i64,
            min_recv_speed: self.min_speed.unwrap_or(0),
            max_recv_speed: self.max_speed,
            ..Default::default()
        };
        let elapsed_ns = self.last_recv_ns - self.start_ns;
        if self.recv_packets > 0 && elapsed_ns >= NS_PER_MS {
            let secs = elapsed_ns as f64 / 1e9;
            stat.recv_time = elapsed_ns / NS_PER_MS;
            stat.recv_speed = (self.recv_bytes as f64 / secs) as i64;
            stat.recv_pps = (self.recv_packets as f64 / secs) as i64;
        }
        // the sender's packet count is known from the command, so loss is
        // inferred here and clamped at zero (duplicates can push recv > count)
        stat.loss = (1.0 - self.recv_packets as f64 / self.params.count as f64).max(0.0);
        stat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::parse_command;
    use crate::packet::HEADER_LEN;

    const T0: i64 = 2_000_000_000_000;

    fn bulk(line: &str) -> BulkReceiver {
        let Ok(Command::Send(p)) = parse_command(line) else { panic!("bad line {line}") };
        let mut rx = BulkReceiver::new(p);
        rx.start(T0);
        rx
    }

    fn datagram(seq: u16, token: u8, sent_ns: i64, size: usize) -> Vec<u8> {
        DataHead {
            timestamp: sent_ns,
            sequence: seq,
            length: (size - HEADER_LEN) as u16,
            token,
        }
        .encode()
    }

    #[test]
    fn reorder_detection() {
        let mut rx = bulk("send count 5 size 32 token s");
        for (i, seq) in [0u16, 2, 1, 3, 4].iter().enumerate() {
            let now = T0 + (i as i64 + 1) * NS_PER_MS;
            rx.on_datagram(now, &datagram(*seq, b's', now, 32));
        }
        let stat = rx.finish();
        assert_eq!(stat.recv_packets, 5);
        assert_eq!(stat.reorder_packets, 1);
        assert_eq!(stat.duplicate_packets, 0);
        assert_eq!(stat.loss, 0.0);
    }

    #[test]
    fn duplicate_detection() {
        let mut rx = bulk("send count 4 size 32 token s");
        for (i, seq) in [0u16, 1, 1, 2].iter().enumerate() {
            let now = T0 + (i as i64 + 1) * NS_PER_MS;
            rx.on_datagram(now, &datagram(*seq, b's', now, 32));
        }
        let stat = rx.finish();
        assert_eq!(stat.recv_packets, 4);
        assert_eq!(stat.duplicate_packets, 1);
        assert_eq!(stat.reorder_packets, 0);
    }

    #[test]
    fn classification_is_complete() {
        let mut rx = bulk("send count 10 size 32 token s timeout 100");
        let now = T0 + NS_PER_MS;
        rx.on_datagram(now, &datagram(0, b's', now, 32)); // received
        rx.on_datagram(now, &datagram(1, b'x', now, 32)); // foreign token
        rx.on_datagram(now, &datagram(2, b's', now - 200 * NS_PER_MS, 32)); // stale
        rx.on_datagram(now, &[0u8; 4]); // truncated
        let stat = rx.finish();
        let delivered = 4;
        assert_eq!(
            stat.recv_packets + stat.illegal_packets + stat.timeout_packets,
            delivered
        );
        assert_eq!(stat.recv_packets, 1);
        assert_eq!(stat.illegal_packets, 2);
        assert_eq!(stat.timeout_packets, 1);
    }

    #[test]
    fn foreign_token_leaves_current_counts_alone() {
        let mut rx = bulk("send count 2 size 32 token s");
        let now = T0 + NS_PER_MS;
        rx.on_datagram(now, &datagram(0, b's', now, 32));
        for seq in 0..50 {
            rx.on_datagram(now, &datagram(seq, b'z', now, 32));
        }
        let stat = rx.finish();
        assert_eq!(stat.recv_packets, 1);
        assert_eq!(stat.recv_bytes, 32);
        assert_eq!(stat.illegal_packets, 50);
    }

    #[test]
    fn loss_is_inferred_from_count() {
        let mut rx = bulk("send count 10 size 32 token s");
        for seq in [0u16, 1, 2, 3, 4, 5] {
            let now = T0 + (seq as i64 + 1) * NS_PER_MS;
            rx.on_datagram(now, &datagram(seq, b's', now, 32));
        }
        let stat = rx.finish();
        assert!((stat.loss - 0.4).abs() < 1e-9);
    }

    #[test]
    fn loss_clamps_at_zero_under_duplication() {
        let mut rx = bulk("send count 2 size 32 token s");
        for seq in [0u16, 0, 1, 1] {
            let now = T0 + NS_PER_MS;
            rx.on_datagram(now, &datagram(seq, b's', now, 32));
        }
        let stat = rx.finish();
        assert_eq!(stat.recv_packets, 4);
        assert_eq!(stat.duplicate_packets, 2);
        assert_eq!(stat.loss, 0.0);
    }

    #[test]
    fn sequence_wraparound_is_not_reorder() {
        let mut rx = bulk("send count 10 size 32 token s");
        let now = T0 + NS_PER_MS;
        rx.on_datagram(now, &datagram(u16::MAX - 1, b's', now, 32));
        rx.on_datagram(now, &datagram(u16::MAX, b's', now, 32));
        rx.on_datagram(now, &datagram(0, b's', now, 32)); // wrapped, still newer
        let stat = rx.finish();
        assert_eq!(stat.reorder_packets, 0);
        assert_eq!(stat.duplicate_packets, 0);
        assert_eq!(stat.recv_packets, 3);
    }

    #[test]
    fn old_sequence_beyond_bitset_counts_as_reorder() {
        let mut rx = bulk("send count 200 size 32 token s");
        let now = T0 + NS_PER_MS;
        rx.on_datagram(now, &datagram(0, b's', now, 32));
        rx.on_datagram(now, &datagram(150, b's', now, 32));
        // seq 0 again: 150 behind the watermark, outside the 64-entry window,
        // so it cannot be proven a duplicate
        rx.on_datagram(now, &datagram(0, b's', now, 32));
        let stat = rx.finish();
        assert_eq!(stat.duplicate_packets, 0);
        assert_eq!(stat.reorder_packets, 1);
    }

    #[test]
    fn throughput_windows_track_min_and_max() {
        let mut rx = bulk("send count 10000 size 1472 token s timeout 10000");
        let mut now = T0;
        // 2.5 s of arrivals at 1 ms spacing
        for seq in 0..2500u16 {
            now = T0 + seq as i64 * NS_PER_MS;
            rx.on_datagram(now, &datagram(seq, b's', now, 1472));
        }
        let stat = rx.finish();
        assert!(stat.min_recv_speed > 0);
        assert!(stat.max_recv_speed >= stat.min_recv_speed);
        assert!(stat.recv_time >= 2400 && stat.recv_time <= 2600);
        assert!(stat.recv_pps >= 990 && stat.recv_pps <= 1010);
    }

    #[test]
    fn classification_holds_under_random_traffic() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut rx = bulk("send count 500 size 32 token s timeout 10000");
        let now = T0 + NS_PER_MS;
        let mut delivered = 0i64;
        for _ in 0..2000 {
            let seq = rng.gen_range(0..500u16);
            let token = if rng.gen_bool(0.9) { b's' } else { b'x' };
            rx.on_datagram(now, &datagram(seq, token, now, 32));
            delivered += 1;
        }
        let stat = rx.finish();
        // every datagram lands in exactly one class
        assert_eq!(
            stat.recv_packets + stat.illegal_packets + stat.timeout_packets,
            delivered
        );
        assert!(stat.duplicate_packets + stat.reorder_packets <= stat.recv_packets);
    }

    #[test]
    fn echo_responder_roundtrips_verbatim() {
        let Ok(Command::Ping(p)) = parse_command("ping token e") else { panic!() };
        let mut responder = EchoResponder::new(p);
        let pkt = datagram(7, b'e', T0, 48);
        responder.on_datagram(&pkt);
        responder.on_datagram(&datagram(8, b'e', T0, 48));
        assert_eq!(responder.pop_echo().unwrap(), pkt, "token and header preserved");
        assert!(responder.pop_echo().is_some());
        assert!(responder.pop_echo().is_none());
        let stat = responder.finish();
        assert_eq!(stat.recv_packets, 2);
        assert_eq!(stat.send_packets, 2);
    }

    #[test]
    fn echo_responder_sheds_overflow() {
        let Ok(Command::Ping(p)) = parse_command("ping token e") else { panic!() };
        let mut responder = EchoResponder::new(p);
        let pkt = datagram(0, b'e', T0, 32);
        for _ in 0..(ECHO_QUEUE_CAP + 5) {
            responder.on_datagram(&pkt);
        }
        let mut echoed = 0;
        while responder.pop_echo().is_some() {
            echoed += 1;
        }
        assert_eq!(echoed, ECHO_QUEUE_CAP);
        let stat = responder.finish();
        assert_eq!(stat.recv_packets, (ECHO_QUEUE_CAP + 5) as i64);
    }
}
