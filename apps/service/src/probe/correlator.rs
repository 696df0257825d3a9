//! Pairing worker connections with their stream events.
//!
//! A worker publishes the source port of each proxy connection it opens; the
//! control channel reports new streams with a `SOURCE_ADDR` carrying the
//! same port. The two signals arrive on independent feeds with no ordering
//! guarantee, so the table stores whichever side shows up first and the
//! second arrival consumes the entry and yields the attach pair.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::control::{CircuitId, StreamId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingAttach {
    /// The worker told us its port; the stream event hasn't arrived yet.
    CircuitKnown(CircuitId),
    /// The stream event arrived first; no worker port seen yet.
    StreamKnown(StreamId),
}

/// Port-correlation table. At most one pending entry per port; consuming an
/// entry removes it, so a port can be reused once its pairing resolved.
#[derive(Default)]
pub struct AttachTable {
    pending: Mutex<HashMap<u16, PendingAttach>>,
}

impl AttachTable {
    /// Circuit side: a worker reported `port` for `circuit`. Returns the
    /// attach pair when the matching stream was already seen.
    pub fn circuit_side(&self, port: u16, circuit: CircuitId) -> Option<(StreamId, CircuitId)> {
        let mut pending = self.pending.lock().unwrap();
        match pending.remove(&port) {
            Some(PendingAttach::StreamKnown(stream)) => Some((stream, circuit)),
            Some(PendingAttach::CircuitKnown(stale)) => {
                tracing::warn!(
                    "port {port} already pending for circuit {stale}, replacing with {circuit}"
                );
                pending.insert(port, PendingAttach::CircuitKnown(circuit));
                None
            }
            None => {
                pending.insert(port, PendingAttach::CircuitKnown(circuit));
                tracing::debug!("pending attachers: {}", pending.len());
                None
            }
        }
    }

    /// Stream side: the control channel reported a new stream from `port`.
    /// Returns the attach pair when the owning circuit is already known.
    pub fn stream_side(&self, port: u16, stream: StreamId) -> Option<(StreamId, CircuitId)> {
        let mut pending = self.pending.lock().unwrap();
        match pending.remove(&port) {
            Some(PendingAttach::CircuitKnown(circuit)) => Some((stream, circuit)),
            Some(PendingAttach::StreamKnown(stale)) => {
                tracing::warn!(
                    "port {port} already pending for stream {stale}, replacing with {stream}"
                );
                pending.insert(port, PendingAttach::StreamKnown(stream));
                None
            }
            None => {
                pending.insert(port, PendingAttach::StreamKnown(stream));
                tracing::debug!("pending attachers: {}", pending.len());
                None
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circuit(id: &str) -> CircuitId {
        CircuitId(id.to_string())
    }

    fn stream(id: &str) -> StreamId {
        StreamId(id.to_string())
    }

    #[test]
    fn circuit_first_then_stream() {
        let table = AttachTable::default();

        assert_eq!(table.circuit_side(51000, circuit("12")), None);
        assert_eq!(table.pending_len(), 1);

        let pair = table.stream_side(51000, stream("35")).unwrap();
        assert_eq!(pair, (stream("35"), circuit("12")));
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn stream_first_then_circuit() {
        let table = AttachTable::default();

        assert_eq!(table.stream_side(51000, stream("35")), None);
        let pair = table.circuit_side(51000, circuit("12")).unwrap();
        assert_eq!(pair, (stream("35"), circuit("12")));
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn consuming_removes_the_entry_and_allows_port_reuse() {
        let table = AttachTable::default();

        table.circuit_side(51000, circuit("12"));
        table.stream_side(51000, stream("35")).unwrap();

        // Same port, next probe connection: pairs with the new circuit only.
        assert_eq!(table.stream_side(51000, stream("40")), None);
        let pair = table.circuit_side(51000, circuit("13")).unwrap();
        assert_eq!(pair, (stream("40"), circuit("13")));
    }

    #[test]
    fn duplicate_same_side_keeps_one_entry_per_port() {
        let table = AttachTable::default();

        table.circuit_side(51000, circuit("12"));
        table.circuit_side(51000, circuit("13"));
        assert_eq!(table.pending_len(), 1);

        // The replacement wins the eventual pairing.
        let pair = table.stream_side(51000, stream("35")).unwrap();
        assert_eq!(pair, (stream("35"), circuit("13")));
    }

    #[test]
    fn distinct_ports_pair_independently() {
        let table = AttachTable::default();

        table.circuit_side(51000, circuit("12"));
        table.circuit_side(51001, circuit("13"));

        let pair_b = table.stream_side(51001, stream("36")).unwrap();
        let pair_a = table.stream_side(51000, stream("35")).unwrap();
        assert_eq!(pair_a, (stream("35"), circuit("12")));
        assert_eq!(pair_b, (stream("36"), circuit("13")));
    }
}
