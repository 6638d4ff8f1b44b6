//! The per-peer statistics record and its aggregation operators.
//!
//! A [`NetStat`] is produced by a measurement engine when a command finishes,
//! shipped agent → coordinator inside a `result` control line, and folded
//! across peers at the coordinator. Two operators are defined:
//! - element-wise sum (`+=`), where `max_*`/`min_*` fields take the
//!   max/min instead of adding;
//! - integer division by a peer count (`averaged`), which deliberately
//!   leaves the `max_*`/`min_*` fields untouched.

use std::collections::HashMap;
use std::fmt;

/// Statistics snapshot for one command on one peer.
///
/// Times are milliseconds, speeds bytes per second, delay/jitter
/// milliseconds. A default-constructed value is the zero element of `+=`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NetStat {
    /// Average round-trip delay in milliseconds.
    pub delay: i64,
    pub max_delay: i64,
    pub min_delay: i64,
    /// Delay spread (max − min) in milliseconds.
    pub jitter: i64,
    /// Standard deviation of the delay samples, milliseconds.
    pub jitter_std: i64,
    /// Lost fraction in [0, 1].
    pub loss: f64,

    pub send_packets: i64,
    pub recv_packets: i64,
    /// Datagrams carrying a foreign token.
    pub illegal_packets: i64,
    pub reorder_packets: i64,
    pub duplicate_packets: i64,
    /// Datagrams that stayed in the network longer than the command timeout.
    pub timeout_packets: i64,

    pub send_bytes: i64,
    pub recv_bytes: i64,

    pub send_time: i64,
    pub recv_time: i64,
    pub max_send_time: i64,
    pub min_send_time: i64,
    pub max_recv_time: i64,
    pub min_recv_time: i64,

    /// Overall send speed in bytes per second.
    pub send_speed: i64,
    pub min_send_speed: i64,
    pub max_send_speed: i64,
    pub recv_speed: i64,
    pub min_recv_speed: i64,
    pub max_recv_speed: i64,
    pub send_avg_speed: i64,
    pub recv_avg_speed: i64,

    pub send_pps: i64,
    pub recv_pps: i64,

    /// Peers connected when the command started.
    pub peers_count: i64,
    /// Peers that failed to report a result.
    pub peers_failed: i64,
}

/// Field lists shared by the operators and the wire form. Keeping them in one
/// place guarantees every field is covered by exactly one aggregation rule.
macro_rules! summed_fields {
    ($m:ident) => {
        $m!(
            send_speed, recv_speed, send_avg_speed, recv_avg_speed, send_packets, recv_packets,
            illegal_packets, reorder_packets, duplicate_packets, timeout_packets, send_pps,
            recv_pps, send_bytes, recv_bytes, send_time, recv_time, delay, jitter, jitter_std,
            peers_count, peers_failed
        );
    };
}
macro_rules! maxed_fields {
    ($m:ident) => {
        $m!(max_send_speed, max_recv_speed, max_delay, max_send_time, max_recv_time);
    };
}
macro_rules! minned_fields {
    ($m:ident) => {
        $m!(min_send_speed, min_recv_speed, min_delay, min_send_time, min_recv_time);
    };
}
macro_rules! all_fields {
    ($m:ident) => {
        $m!(
            loss, send_speed, recv_speed, send_avg_speed, recv_avg_speed, max_send_speed,
            max_recv_speed, min_send_speed, min_recv_speed, send_packets, recv_packets,
            illegal_packets, reorder_packets, duplicate_packets, timeout_packets, send_pps,
            recv_pps, send_bytes, recv_bytes, send_time, recv_time, max_send_time, max_recv_time,
            min_send_time, min_recv_time, delay, min_delay, max_delay, jitter, jitter_std,
            peers_count, peers_failed
        );
    };
}

impl NetStat {
    /// Element-wise accumulate `other` into `self`.
    ///
    /// Summable fields add; `max_*` fields keep the larger value, `min_*`
    /// fields the smaller. `Default::default()` is the neutral element.
    pub fn merge(&mut self, other: &NetStat) {
        self.loss += other.loss;
        macro_rules! add { ($($f:ident),* $(,)?) => { $( self.$f += other.$f; )* } }
        macro_rules! take_max { ($($f:ident),* $(,)?) => { $( self.$f = self.$f.max(other.$f); )* } }
        macro_rules! take_min { ($($f:ident),* $(,)?) => { $( self.$f = self.$f.min(other.$f); )* } }
        summed_fields!(add);
        maxed_fields!(take_max);
        minned_fields!(take_min);
    }

    /// Divide the summed fields by a peer count, for a per-peer average.
    ///
    /// `max_*`/`min_*` fields are intentionally left unchanged: a maximum
    /// across peers is still a maximum after averaging.
    pub fn averaged(mut self, peers: i64) -> NetStat {
        if peers <= 1 {
            return self;
        }
        self.loss /= peers as f64;
        macro_rules! div { ($($f:ident),* $(,)?) => { $( self.$f /= peers; )* } }
        summed_fields!(div);
        self
    }

    /// Render as the `key value` pairs carried by a `result` control line.
    ///
    /// Zero-valued fields are omitted; a missing key parses back as zero.
    pub fn to_args(&self) -> String {
        let mut out = String::new();
        macro_rules! put {
            ($($f:ident),* $(,)?) => {
                $(
                    if self.$f != Default::default() {
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(concat!(stringify!($f), " "));
                        out.push_str(&self.$f.to_string());
                    }
                )*
            };
        }
        all_fields!(put);
        out
    }

    /// Rebuild a stat from parsed `key value` arguments.
    ///
    /// Unknown keys are ignored; unparseable or absent values read as zero.
    pub fn from_args(args: &HashMap<String, String>) -> NetStat {
        let mut stat = NetStat::default();
        macro_rules! get {
            ($($f:ident),* $(,)?) => {
                $(
                    if let Some(v) = args.get(stringify!($f)) {
                        stat.$f = v.parse().unwrap_or_default();
                    }
                )*
            };
        }
        all_fields!(get);
        stat
    }
}

impl fmt::Display for NetStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.to_args();
        if args.is_empty() {
            f.write_str("(empty)")
        } else {
            f.write_str(&args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_a() -> NetStat {
        NetStat {
            delay: 10,
            min_delay: 4,
            max_delay: 25,
            jitter: 21,
            jitter_std: 3,
            loss: 0.2,
            send_packets: 100,
            recv_packets: 80,
            send_bytes: 6400,
            recv_bytes: 5120,
            send_time: 1000,
            recv_time: 990,
            min_send_speed: 5000,
            max_send_speed: 7000,
            ..Default::default()
        }
    }

    fn sample_b() -> NetStat {
        NetStat {
            delay: 6,
            min_delay: 2,
            max_delay: 30,
            loss: 0.1,
            send_packets: 50,
            recv_packets: 45,
            reorder_packets: 3,
            duplicate_packets: 1,
            min_send_speed: 4000,
            max_send_speed: 9000,
            ..Default::default()
        }
    }

    #[test]
    fn merge_sums_and_keeps_extremes() {
        let mut total = sample_a();
        total.merge(&sample_b());
        assert_eq!(total.send_packets, 150);
        assert_eq!(total.recv_packets, 125);
        assert!((total.loss - 0.3).abs() < 1e-9);
        assert_eq!(total.max_delay, 30);
        assert_eq!(total.min_delay, 2);
        assert_eq!(total.max_send_speed, 9000);
        assert_eq!(total.min_send_speed, 4000);
    }

    #[test]
    fn merge_is_commutative_on_all_fields() {
        let mut ab = sample_a();
        ab.merge(&sample_b());
        let mut ba = sample_b();
        ba.merge(&sample_a());
        assert_eq!(ab, ba);
    }

    #[test]
    fn merge_is_associative() {
        let c = NetStat { send_packets: 7, max_delay: 50, loss: 0.05, ..Default::default() };
        let mut left = sample_a();
        left.merge(&sample_b());
        left.merge(&c);
        let mut bc = sample_b();
        bc.merge(&c);
        let mut right = sample_a();
        right.merge(&bc);
        assert_eq!(left, right);
    }

    #[test]
    fn merge_zero_is_identity_for_sums() {
        let mut merged = sample_a();
        merged.merge(&NetStat::default());
        // min_* fields floor at the zero element; every other field is intact.
        let expected = NetStat { min_delay: 0, min_send_speed: 0, ..sample_a() };
        assert_eq!(merged, expected);
    }

    #[test]
    fn averaged_skips_extremes() {
        let mut total = sample_a();
        total.merge(&sample_b());
        let avg = total.clone().averaged(2);
        assert_eq!(avg.send_packets, 75);
        assert_eq!(avg.max_delay, total.max_delay, "max untouched by division");
        assert_eq!(avg.min_send_speed, total.min_send_speed, "min untouched by division");
        assert!((avg.loss - 0.15).abs() < 1e-9);
    }

    #[test]
    fn averaged_by_one_is_identity() {
        assert_eq!(sample_a().averaged(1), sample_a());
    }

    #[test]
    fn args_roundtrip() {
        let stat = sample_a();
        let args_line = stat.to_args();
        let mut map = HashMap::new();
        let mut it = args_line.split_whitespace();
        while let (Some(k), Some(v)) = (it.next(), it.next()) {
            map.insert(k.to_string(), v.to_string());
        }
        assert_eq!(NetStat::from_args(&map), stat);
    }

    #[test]
    fn zero_fields_are_omitted() {
        let stat = NetStat { recv_packets: 3, ..Default::default() };
        assert_eq!(stat.to_args(), "recv_packets 3");
    }

    #[test]
    fn from_args_ignores_junk() {
        let mut map = HashMap::new();
        map.insert("recv_packets".into(), "12".into());
        map.insert("bogus_key".into(), "9".into());
        map.insert("delay".into(), "not-a-number".into());
        let stat = NetStat::from_args(&map);
        assert_eq!(stat.recv_packets, 12);
        assert_eq!(stat.delay, 0);
    }
}
