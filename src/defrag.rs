//! Reassembles fragmented UDP-over-QUIC datagrams by message id.
//!
//! Mirrors the source's small fixed-capacity ring of in-flight reassembly
//! slots: a new `msgId` evicts the oldest slot, discarding any partial data
//! it held.

use crate::protocol::UdpMessage;
use bytes::{Bytes, BytesMut};

const RING_CAPACITY: usize = 16;

struct Slot {
    msg_id: u16,
    frag_count: u8,
    received: u8,
    host: String,
    port: u16,
    session_id: u32,
    parts: Vec<Option<Bytes>>,
}

impl Slot {
    fn new(msg_id: u16, frag_count: u8) -> Self {
        Slot {
            msg_id,
            frag_count,
            received: 0,
            host: String::new(),
            port: 0,
            session_id: 0,
            parts: vec![None; frag_count as usize],
        }
    }
}

/// Per-connection UDP fragment reassembly state.
#[derive(Default)]
pub struct Defragger {
    ring: Vec<Slot>,
    next_evict: usize,
}

impl Defragger {
    pub fn new() -> Self {
        Defragger {
            ring: Vec::with_capacity(RING_CAPACITY),
            next_evict: 0,
        }
    }

    /// Feeds one received fragment (or unfragmented message) in. Returns
    /// `Some(message)` once a complete message is assembled, with `data`
    /// concatenated in `frag_index` order and `host`/`port` taken from
    /// fragment 0.
    pub fn feed(&mut self, msg: UdpMessage) -> Option<UdpMessage> {
        if msg.frag_count <= 1 {
            return Some(msg);
        }
        if msg.msg_id == 0 {
            // msg_id 0 is reserved for "single fragment"; a fragmented
            // message claiming it is malformed, drop it.
            return None;
        }

        let slot_idx = match self.ring.iter().position(|s| s.msg_id == msg.msg_id) {
            Some(i) => i,
            None => self.insert_slot(msg.msg_id, msg.frag_count),
        };

        let slot = &mut self.ring[slot_idx];
        if slot.frag_count != msg.frag_count {
            // Inconsistent framing for this msg_id; restart the slot.
            *slot = Slot::new(msg.msg_id, msg.frag_count);
        }

        let idx = msg.frag_index as usize;
        if idx >= slot.parts.len() {
            return None;
        }
        if msg.frag_index == 0 {
            slot.host = msg.host.clone();
            slot.port = msg.port;
            slot.session_id = msg.session_id;
        }
        if slot.parts[idx].is_none() {
            slot.received += 1;
        }
        slot.parts[idx] = Some(msg.data);

        if slot.received < slot.frag_count {
            return None;
        }

        let mut combined = BytesMut::new();
        for part in slot.parts.iter() {
            combined.extend_from_slice(part.as_ref()?);
        }
        let assembled = UdpMessage {
            session_id: slot.session_id,
            host: slot.host.clone(),
            port: slot.port,
            msg_id: msg.msg_id,
            frag_count: 1,
            frag_index: 0,
            data: combined.freeze(),
        };
        self.ring.remove(slot_idx);
        Some(assembled)
    }

    fn insert_slot(&mut self, msg_id: u16, frag_count: u8) -> usize {
        if self.ring.len() < RING_CAPACITY {
            self.ring.push(Slot::new(msg_id, frag_count));
            return self.ring.len() - 1;
        }
        let idx = self.next_evict % RING_CAPACITY;
        self.next_evict = (self.next_evict + 1) % RING_CAPACITY;
        self.ring[idx] = Slot::new(msg_id, frag_count);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fragment;
    use rand::seq::SliceRandom;

    fn unfragmented(data: &[u8]) -> UdpMessage {
        UdpMessage {
            session_id: 1,
            host: "1.2.3.4".into(),
            port: 80,
            msg_id: 0,
            frag_count: 1,
            frag_index: 0,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn single_fragment_emits_immediately() {
        let mut df = Defragger::new();
        let msg = unfragmented(b"hello");
        assert_eq!(df.feed(msg.clone()), Some(msg));
    }

    #[test]
    fn fragments_in_order_reassemble() {
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let base = unfragmented(&data);
        let frags = fragment(base.clone(), 77, 512);
        let mut df = Defragger::new();
        let mut out = None;
        for f in frags {
            out = df.feed(f);
        }
        let assembled = out.expect("message should be complete after last fragment");
        assert_eq!(assembled.data, Bytes::from(data));
        assert_eq!(assembled.host, "1.2.3.4");
    }

    #[test]
    fn fragments_in_any_permutation_reassemble() {
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let base = unfragmented(&data);
        let mut frags = fragment(base.clone(), 99, 512);
        let mut rng = rand::thread_rng();
        frags.shuffle(&mut rng);

        let mut df = Defragger::new();
        let mut out = None;
        for f in frags {
            if let Some(m) = df.feed(f) {
                out = Some(m);
            }
        }
        let assembled = out.expect("message should be complete regardless of arrival order");
        assert_eq!(assembled.data, Bytes::from(data));
    }

    #[test]
    fn ring_evicts_oldest_on_overflow() {
        let mut df = Defragger::new();
        // Fill the ring with 16 incomplete 2-fragment messages, only feeding
        // fragment 0 of each so none complete.
        for id in 1..=(RING_CAPACITY as u16 + 1) {
            let base = unfragmented(b"x");
            let frags = fragment(base, id, 512);
            assert!(df.feed(frags[0].clone()).is_none());
        }
        assert_eq!(df.ring.len(), RING_CAPACITY);
        // The oldest slot (msg_id == 1) should have been evicted; completing
        // it now starts a fresh slot rather than finishing the old one.
        let base = unfragmented(b"abcdef");
        let frags = fragment(base.clone(), 1, 3);
        for f in frags {
            df.feed(f);
        }
    }

    #[test]
    fn zero_msg_id_with_frag_count_above_one_is_dropped() {
        let mut df = Defragger::new();
        let msg = UdpMessage {
            session_id: 1,
            host: "1.2.3.4".into(),
            port: 80,
            msg_id: 0,
            frag_count: 2,
            frag_index: 0,
            data: Bytes::from_static(b"x"),
        };
        assert_eq!(df.feed(msg), None);
    }
}
