//! `ReceiveBuffer` (C2, spec §4.2). Reorders inbound sequenced packets into
//! a contiguous stream, dropping duplicates and bounding how much
//! out-of-order data it will hold before giving up.

use std::collections::BTreeMap;

use tunnox_types::CoreError;

#[derive(Debug, Clone, Copy)]
pub struct ReceiveBufferLimits {
    pub max_out_of_order: usize,
}

impl Default for ReceiveBufferLimits {
    fn default() -> Self {
        ReceiveBufferLimits { max_out_of_order: 100 }
    }
}

pub struct ReceiveBuffer {
    limits: ReceiveBufferLimits,
    next_expected: u64,
    reorder: BTreeMap<u64, Vec<u8>>,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::with_limits(ReceiveBufferLimits::default())
    }

    pub fn with_limits(limits: ReceiveBufferLimits) -> Self {
        ReceiveBuffer {
            limits,
            next_expected: 1,
            reorder: BTreeMap::new(),
        }
    }

    /// Applies the three-way priority rule of spec §4.2: duplicates are
    /// dropped, in-order packets drain any contiguous successors already
    /// buffered, and far-future packets are held (bounded) or rejected.
    pub fn receive(&mut self, seq_num: u64, data: Vec<u8>) -> Result<Vec<Vec<u8>>, CoreError> {
        if seq_num < self.next_expected {
            return Ok(Vec::new());
        }

        if seq_num > self.next_expected {
            if self.reorder.len() >= self.limits.max_out_of_order {
                return Err(CoreError::resource_exhausted("too many out-of-order packets buffered"));
            }
            self.reorder.entry(seq_num).or_insert(data);
            return Ok(Vec::new());
        }

        let mut out = vec![data];
        self.next_expected += 1;
        while let Some(next) = self.reorder.remove(&self.next_expected) {
            out.push(next);
            self.next_expected += 1;
        }
        Ok(out)
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn buffered_len(&self) -> usize {
        self.reorder.len()
    }

    /// Used by the resume/migration manager to persist how far the peer had
    /// drained (spec §3 `TunnelState.nextExpectedSeq`).
    pub fn restore(&mut self, next_expected: u64) {
        self.next_expected = next_expected;
        self.reorder.clear();
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_below_watermark_is_dropped() {
        let mut buf = ReceiveBuffer::new();
        buf.receive(1, vec![1]).unwrap();
        let out = buf.receive(1, vec![1]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn in_order_packet_drains_contiguous_successors() {
        let mut buf = ReceiveBuffer::new();
        buf.receive(2, vec![2]).unwrap();
        buf.receive(3, vec![3]).unwrap();
        let out = buf.receive(1, vec![1]).unwrap();
        assert_eq!(out, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(buf.next_expected(), 4);
    }

    #[test]
    fn far_future_packet_is_buffered_until_reachable() {
        let mut buf = ReceiveBuffer::new();
        let out = buf.receive(5, vec![5]).unwrap();
        assert!(out.is_empty());
        assert_eq!(buf.buffered_len(), 1);
    }

    #[test]
    fn too_many_out_of_order_fails_cleanly() {
        let mut buf = ReceiveBuffer::with_limits(ReceiveBufferLimits { max_out_of_order: 2 });
        buf.receive(5, vec![5]).unwrap();
        buf.receive(6, vec![6]).unwrap();
        assert!(buf.receive(7, vec![7]).is_err());
    }

    #[test]
    fn any_permutation_reassembles_the_same_concatenation() {
        let permutations: &[[u64; 4]] = &[[1, 2, 3, 4], [4, 3, 2, 1], [2, 4, 1, 3], [3, 1, 4, 2]];

        for perm in permutations {
            let mut buf = ReceiveBuffer::new();
            let mut assembled = Vec::new();
            for &seq in perm {
                assembled.extend(buf.receive(seq, vec![seq as u8]).unwrap());
            }
            assert_eq!(assembled, vec![vec![1u8], vec![2u8], vec![3u8], vec![4u8]]);
        }
    }
}
