use std::collections::BTreeMap;

use crate::bgp::route::{AddressFamily, PeerId};

/// Where a source peer stands in an ongoing dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDumpStatus {
    StillToDump,
    CurrentlyDumping,
    DownDuringDump,
    CompletelyDumped,
}

#[derive(Debug)]
struct PeerDumpState<A: AddressFamily> {
    status: PeerDumpStatus,
    /// Snapshot of the source RIB-In's prefixes at dump start.
    nets: Vec<A::Net>,
    cursor: usize,
    /// Epoch the snapshot was taken under; routes from a newer peering
    /// are not dumped twice (they arrive through the normal path).
    genid: u32,
    last_net_before_down: Option<A::Net>,
}

/// Cursor over the union of peer RIB-Ins, dumped one source peer at a
/// time toward a newly established peer. Snapshot semantics: a source
/// going down mid-dump is recorded and skipped, never re-walked.
#[derive(Debug)]
pub struct DumpIterator<A: AddressFamily> {
    dump_peer: PeerId,
    peers: BTreeMap<PeerId, PeerDumpState<A>>,
}

impl<A: AddressFamily> DumpIterator<A> {
    pub fn new(dump_peer: PeerId) -> Self {
        Self {
            dump_peer,
            peers: BTreeMap::new(),
        }
    }

    pub fn dump_peer(&self) -> PeerId {
        self.dump_peer
    }

    pub fn add_peer(&mut self, peer: PeerId, genid: u32, nets: Vec<A::Net>) {
        self.peers.insert(
            peer,
            PeerDumpState {
                status: PeerDumpStatus::StillToDump,
                nets,
                cursor: 0,
                genid,
                last_net_before_down: None,
            },
        );
    }

    /// The source currently being walked, moving to the next pending one.
    pub fn current_peer(&mut self) -> Option<PeerId> {
        for (peer, state) in self.peers.iter_mut() {
            match state.status {
                PeerDumpStatus::CurrentlyDumping => return Some(*peer),
                PeerDumpStatus::StillToDump => {
                    state.status = PeerDumpStatus::CurrentlyDumping;
                    return Some(*peer);
                }
                _ => continue,
            }
        }
        None
    }

    /// Next snapshotted prefix of `peer`, advancing the cursor.
    pub fn next_net(&mut self, peer: PeerId) -> Option<A::Net> {
        let state = self.peers.get_mut(&peer)?;
        if state.status != PeerDumpStatus::CurrentlyDumping {
            return None;
        }
        let net = state.nets.get(state.cursor).copied();
        if net.is_some() {
            state.cursor += 1;
        }
        net
    }

    pub fn genid_matches(&self, peer: PeerId, genid: u32) -> bool {
        self.peers
            .get(&peer)
            .map(|state| state.genid == genid)
            .unwrap_or(false)
    }

    pub fn peer_done(&mut self, peer: PeerId) {
        if let Some(state) = self.peers.get_mut(&peer) {
            if state.status == PeerDumpStatus::CurrentlyDumping
                || state.status == PeerDumpStatus::StillToDump
            {
                state.status = PeerDumpStatus::CompletelyDumped;
            }
        }
    }

    /// A source peering dropped while we were dumping it. Record where we
    /// were and stop walking it; its withdraws flow through the normal
    /// path and must not be contradicted by stale dump entries.
    pub fn peer_went_down(&mut self, peer: PeerId) {
        if let Some(state) = self.peers.get_mut(&peer) {
            if state.status == PeerDumpStatus::CurrentlyDumping
                || state.status == PeerDumpStatus::StillToDump
            {
                state.last_net_before_down =
                    state.cursor.checked_sub(1).and_then(|i| state.nets.get(i)).copied();
                state.status = PeerDumpStatus::DownDuringDump;
            }
        }
    }

    pub fn status(&self, peer: PeerId) -> Option<PeerDumpStatus> {
        self.peers.get(&peer).map(|state| state.status)
    }

    pub fn last_net_before_down(&self, peer: PeerId) -> Option<A::Net> {
        self.peers.get(&peer)?.last_net_before_down
    }

    pub fn is_complete(&self) -> bool {
        self.peers.values().all(|state| {
            matches!(
                state.status,
                PeerDumpStatus::CompletelyDumped | PeerDumpStatus::DownDuringDump
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::route::Ipv4Af;
    use ipnet::Ipv4Net;

    fn nets(list: &[&str]) -> Vec<Ipv4Net> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn walk_in_order_then_complete() {
        let mut dump: DumpIterator<Ipv4Af> = DumpIterator::new(PeerId(9));
        dump.add_peer(PeerId(1), 3, nets(&["10.0.0.0/24", "10.0.1.0/24"]));
        dump.add_peer(PeerId(2), 5, nets(&["192.0.2.0/24"]));

        let p = dump.current_peer().unwrap();
        assert_eq!(p, PeerId(1));
        assert_eq!(dump.next_net(p), Some("10.0.0.0/24".parse().unwrap()));
        assert_eq!(dump.next_net(p), Some("10.0.1.0/24".parse().unwrap()));
        assert_eq!(dump.next_net(p), None);
        dump.peer_done(p);

        let p = dump.current_peer().unwrap();
        assert_eq!(p, PeerId(2));
        assert!(dump.genid_matches(p, 5));
        assert!(!dump.genid_matches(p, 6));
        assert_eq!(dump.next_net(p), Some("192.0.2.0/24".parse().unwrap()));
        assert_eq!(dump.next_net(p), None);
        dump.peer_done(p);

        assert!(dump.is_complete());
    }

    #[test]
    fn down_during_dump_records_last_net() {
        let mut dump: DumpIterator<Ipv4Af> = DumpIterator::new(PeerId(9));
        dump.add_peer(PeerId(1), 1, nets(&["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24"]));

        let p = dump.current_peer().unwrap();
        let _ = dump.next_net(p);
        let _ = dump.next_net(p);
        dump.peer_went_down(p);

        assert_eq!(dump.status(p), Some(PeerDumpStatus::DownDuringDump));
        assert_eq!(
            dump.last_net_before_down(p),
            Some("10.0.1.0/24".parse().unwrap())
        );
        assert_eq!(dump.next_net(p), None);
        assert!(dump.is_complete());
    }
}
