//! `SendBuffer` (C2, spec §4.2). Holds outbound sequenced packets until the
//! peer acks them, so a reconnecting tunnel can retransmit anything it
//! never heard back on. Grounded on the teacher's `net::buffer` send/ack
//! bookkeeping, generalized from a fixed-size ring to the spec's byte- and
//! packet-count caps.

use std::collections::BTreeMap;

use tunnox_common::time::timestamp_millis;
use tunnox_types::{BufferedPacket, CoreError};

#[derive(Debug, Clone, Copy)]
pub struct SendBufferLimits {
    pub max_bytes: usize,
    pub max_packets: usize,
    pub resend_timeout_ms: i64,
}

impl Default for SendBufferLimits {
    fn default() -> Self {
        SendBufferLimits {
            max_bytes: 10 * 1024 * 1024,
            max_packets: 1000,
            resend_timeout_ms: 3_000,
        }
    }
}

/// Sliding-window buffer of not-yet-confirmed outbound packets, keyed by
/// `seqNum`. Sequence numbers start at 1 and are strictly monotonically
/// increasing (spec §8).
pub struct SendBuffer {
    limits: SendBufferLimits,
    next_seq: u64,
    total_bytes: usize,
    packets: BTreeMap<u64, BufferedPacket>,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::with_limits(SendBufferLimits::default())
    }

    pub fn with_limits(limits: SendBufferLimits) -> Self {
        SendBuffer {
            limits,
            next_seq: 1,
            total_bytes: 0,
            packets: BTreeMap::new(),
        }
    }

    /// Allocates the next sequence number and retains `data` until
    /// confirmed. Returns `ErrResourceExhausted`-flavoured errors (spec:
    /// `ErrBufferFull`) when either cap would be exceeded, rather than
    /// blocking — backpressure is the caller's problem (spec §5).
    pub fn send(&mut self, data: Vec<u8>) -> Result<u64, CoreError> {
        if self.packets.len() >= self.limits.max_packets {
            return Err(CoreError::resource_exhausted("send buffer full: too many in-flight packets"));
        }
        if self.total_bytes + data.len() > self.limits.max_bytes {
            return Err(CoreError::resource_exhausted("send buffer full: byte cap exceeded"));
        }

        let seq_num = self.next_seq;
        self.next_seq += 1;
        self.total_bytes += data.len();
        self.packets.insert(
            seq_num,
            BufferedPacket {
                seq_num,
                data,
                sent_at_unix: timestamp_millis(),
                retry_count: 0,
            },
        );
        Ok(seq_num)
    }

    /// Removes every packet with `seq < ack` (spec §8: "removes exactly the
    /// packets with seq < k").
    pub fn confirm_up_to(&mut self, ack: u64) {
        let tail = self.packets.split_off(&ack);
        for (_, pkt) in self.packets.iter() {
            self.total_bytes -= pkt.data.len();
        }
        self.packets = tail;
    }

    /// Removes exactly one packet, used when a peer acks individual
    /// out-of-order packets rather than a contiguous watermark.
    pub fn confirm_packet(&mut self, seq: u64) {
        if let Some(pkt) = self.packets.remove(&seq) {
            self.total_bytes -= pkt.data.len();
        }
    }

    /// Packets older than `resend_timeout_ms` that still await an ack.
    pub fn unconfirmed_packets(&self) -> Vec<BufferedPacket> {
        let now = timestamp_millis();
        self.packets
            .values()
            .filter(|pkt| now - pkt.sent_at_unix >= self.limits.resend_timeout_ms)
            .cloned()
            .collect()
    }

    pub fn mark_resent(&mut self, seq: u64) {
        if let Some(pkt) = self.packets.get_mut(&seq) {
            pkt.sent_at_unix = timestamp_millis();
            pkt.retry_count += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Snapshot used by the resume/migration manager (C10) to persist a
    /// `TunnelState`.
    pub fn snapshot(&self) -> Vec<BufferedPacket> {
        self.packets.values().cloned().collect()
    }

    /// Restores a previously persisted set of in-flight packets, used when
    /// a resume token is validated (spec §4.10).
    pub fn restore(&mut self, next_seq: u64, packets: Vec<BufferedPacket>) {
        self.next_seq = next_seq;
        self.total_bytes = packets.iter().map(|p| p.data.len()).sum();
        self.packets = packets.into_iter().map(|p| (p.seq_num, p)).collect();
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_nums_start_at_one_and_increase_monotonically() {
        let mut buf = SendBuffer::new();
        assert_eq!(buf.send(vec![1]).unwrap(), 1);
        assert_eq!(buf.send(vec![2]).unwrap(), 2);
        assert_eq!(buf.send(vec![3]).unwrap(), 3);
    }

    #[test]
    fn confirm_up_to_removes_exactly_the_prefix() {
        let mut buf = SendBuffer::new();
        for i in 1..=5u8 {
            buf.send(vec![i]).unwrap();
        }
        buf.confirm_up_to(3);
        assert_eq!(buf.len(), 3);
        assert!(buf.unconfirmed_packets().iter().all(|p| p.seq_num >= 3));
    }

    #[test]
    fn packet_cap_rejects_without_blocking() {
        let mut buf = SendBuffer::with_limits(SendBufferLimits {
            max_bytes: 1024,
            max_packets: 2,
            resend_timeout_ms: 3_000,
        });
        buf.send(vec![1]).unwrap();
        buf.send(vec![2]).unwrap();
        assert!(buf.send(vec![3]).is_err());
    }

    #[test]
    fn byte_cap_rejects_oversized_batch() {
        let mut buf = SendBuffer::with_limits(SendBufferLimits {
            max_bytes: 4,
            max_packets: 100,
            resend_timeout_ms: 3_000,
        });
        assert!(buf.send(vec![0; 5]).is_err());
    }

    #[test]
    fn restore_reinstates_in_flight_packets_for_resend() {
        let mut buf = SendBuffer::new();
        buf.send(vec![1]).unwrap();
        buf.send(vec![2]).unwrap();
        let snapshot = buf.snapshot();
        let next = buf.next_seq();

        let mut restored = SendBuffer::new();
        restored.restore(next, snapshot);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.next_seq(), next);
    }
}
