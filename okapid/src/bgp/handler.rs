use std::net::Ipv4Addr;
use std::sync::Arc;

use bgp_wire::{Afi, MpNlri, MpReachAttr, MpUnreachAttr, PathAttrs, Safi, UpdatePacket};
use ipnet::{Ipv4Net, Ipv6Net};

use crate::bgp::route::{Ipv4Af, Ipv6Af, PeerId, PeerKind};
use crate::bgp::table::{Outbound, Pipeline};
use crate::error::{CoreError, Result};

/// Import-side facts needed while decomposing one UPDATE.
pub struct IngressPeer {
    pub id: PeerId,
    pub kind: PeerKind,
    pub local_as: u32,
    pub router_id: Ipv4Addr,
    pub cluster_id: Ipv4Addr,
    pub prefix_limit: Option<u32>,
}

/// Outcome of feeding one UPDATE into the pipelines.
#[derive(Debug, PartialEq, Eq)]
pub enum IngressOutcome {
    Ok,
    /// The peer crossed its configured prefix limit. Prefixes accepted
    /// before the limit tripped stay in the RIB-In; the peering-down
    /// sweep that follows withdraws them (no rollback).
    PrefixLimitExceeded,
}

/// Mechanical import checks that drop the whole reachability part of an
/// UPDATE: AS-path loop, our own ORIGINATOR_ID, our cluster id in the
/// CLUSTER_LIST.
fn import_loop_check(peer: &IngressPeer, attrs: &PathAttrs) -> bool {
    if let Some(aspath) = &attrs.aspath {
        if aspath.contains(peer.local_as) {
            return false;
        }
    }
    if let Some(originator) = attrs.originator_id {
        if originator.id == peer.router_id {
            return false;
        }
    }
    if let Some(cluster_list) = &attrs.cluster_list {
        if cluster_list.contains(&peer.cluster_id) {
            return false;
        }
    }
    true
}

/// Decompose a decoded UPDATE into pipeline operations: withdraws become
/// deletes, NLRI become adds, each against the family it belongs to.
pub fn update_received(
    peer: &IngressPeer,
    pipeline4: &mut Pipeline<Ipv4Af>,
    pipeline6: &mut Pipeline<Ipv6Af>,
    packet: UpdatePacket,
) -> Result<IngressOutcome> {
    let UpdatePacket {
        attrs,
        ipv4_update,
        ipv4_withdraw,
        mp_update,
        mp_withdraw,
        ..
    } = packet;

    for net in ipv4_withdraw {
        pipeline4.delete_route(peer.id, net)?;
    }
    if let Some(mp) = mp_withdraw {
        match mp.withdraw {
            MpNlri::Ipv4(nets) => {
                for net in nets {
                    pipeline4.delete_route(peer.id, net)?;
                }
            }
            MpNlri::Ipv6(nets) => {
                for net in nets {
                    pipeline6.delete_route(peer.id, net)?;
                }
            }
        }
    }

    let has_v4_nlri = !ipv4_update.is_empty();
    let mp_nlri = mp_update.map(|mp| mp.nlri);
    let has_any_nlri = has_v4_nlri || mp_nlri.as_ref().map(|n| !n.is_empty()).unwrap_or(false);

    if has_any_nlri {
        let mut pa = PathAttrs::from_attrs(attrs)?;
        pa.well_known_check(has_v4_nlri)?;
        if peer.kind.is_ebgp() {
            // LOCAL_PREF never crosses an external boundary inbound.
            pa.local_pref = None;
        }
        if !import_loop_check(peer, &pa) {
            // Looped routes are silently dropped, withdraws were already
            // applied above.
            return Ok(IngressOutcome::Ok);
        }
        let pa = Arc::new(pa);

        for net in ipv4_update {
            pipeline4.add_route(peer.id, net, pa.clone())?;
        }
        match mp_nlri {
            Some(MpNlri::Ipv4(nets)) => {
                for net in nets {
                    pipeline4.add_route(peer.id, net, pa.clone())?;
                }
            }
            Some(MpNlri::Ipv6(nets)) => {
                for net in nets {
                    pipeline6.add_route(peer.id, net, pa.clone())?;
                }
            }
            None => {}
        }
    }

    pipeline4.push(peer.id)?;
    pipeline6.push(peer.id)?;

    if let Some(limit) = peer.prefix_limit {
        let held = pipeline4.ribin_route_count(peer.id) + pipeline6.ribin_route_count(peer.id);
        if held as u32 > limit {
            return Ok(IngressOutcome::PrefixLimitExceeded);
        }
    }
    Ok(IngressOutcome::Ok)
}

/// One peer's egress batch collected between pushes.
#[derive(Debug, Default)]
pub struct OutboundBatch {
    pub announce4: Vec<(Ipv4Net, Arc<PathAttrs>)>,
    pub withdraw4: Vec<Ipv4Net>,
    pub announce6: Vec<(Ipv6Net, Arc<PathAttrs>)>,
    pub withdraw6: Vec<Ipv6Net>,
    pub push: bool,
}

impl OutboundBatch {
    pub fn is_empty(&self) -> bool {
        self.announce4.is_empty()
            && self.withdraw4.is_empty()
            && self.announce6.is_empty()
            && self.withdraw6.is_empty()
    }
}

pub fn collect_outbound4(
    batches: &mut std::collections::BTreeMap<PeerId, OutboundBatch>,
    outbound: Vec<Outbound<Ipv4Af>>,
) {
    for out in outbound {
        match out {
            Outbound::Update { peer, net, attrs } => {
                batches.entry(peer).or_default().announce4.push((net, attrs));
            }
            Outbound::Withdraw { peer, net } => {
                batches.entry(peer).or_default().withdraw4.push(net);
            }
            Outbound::Push { peer } => {
                batches.entry(peer).or_default().push = true;
            }
        }
    }
}

pub fn collect_outbound6(
    batches: &mut std::collections::BTreeMap<PeerId, OutboundBatch>,
    outbound: Vec<Outbound<Ipv6Af>>,
) {
    for out in outbound {
        match out {
            Outbound::Update { peer, net, attrs } => {
                batches.entry(peer).or_default().announce6.push((net, attrs));
            }
            Outbound::Withdraw { peer, net } => {
                batches.entry(peer).or_default().withdraw6.push(net);
            }
            Outbound::Push { peer } => {
                batches.entry(peer).or_default().push = true;
            }
        }
    }
}

/// Assemble UPDATE messages from a batch: announcements sharing one
/// attribute set ride together, packed until the next NLRI would cross
/// the 4096-octet ceiling (`big_enough`), then a fresh message starts.
pub fn build_updates(batch: OutboundBatch, as4: bool) -> Result<Vec<UpdatePacket>> {
    let mut packets: Vec<UpdatePacket> = Vec::new();

    // IPv4 withdraws first, then grouped announcements.
    let mut withdraw4 = batch.withdraw4;
    while !withdraw4.is_empty() {
        let mut packet = UpdatePacket::new();
        while let Some(net) = withdraw4.pop() {
            packet.ipv4_withdraw.push(net);
            if !big_enough(&packet, as4) {
                continue;
            }
            let overflow = packet.ipv4_withdraw.pop().expect("just pushed");
            withdraw4.push(overflow);
            break;
        }
        packets.push(packet);
    }

    for (attrs, nets) in group_by_attrs(batch.announce4) {
        let mut nets: Vec<Ipv4Net> = nets;
        while !nets.is_empty() {
            let mut packet = UpdatePacket::new();
            packet.attrs = attrs.to_attrs(as4);
            while let Some(net) = nets.pop() {
                packet.ipv4_update.push(net);
                if !big_enough(&packet, as4) {
                    continue;
                }
                let overflow = packet.ipv4_update.pop().expect("just pushed");
                if packet.ipv4_update.is_empty() {
                    return Err(CoreError::fatal(format!(
                        "single NLRI {} does not fit an UPDATE",
                        overflow
                    )));
                }
                nets.push(overflow);
                break;
            }
            packets.push(packet);
        }
    }

    if !batch.withdraw6.is_empty() {
        let mut packet = UpdatePacket::new();
        packet.mp_withdraw = Some(MpUnreachAttr {
            afi: Afi::Ip6,
            safi: Safi::Unicast,
            withdraw: MpNlri::Ipv6(batch.withdraw6),
        });
        packets.push(packet);
    }

    for (attrs, nets) in group_by_attrs(batch.announce6) {
        let Some(nexthop) = attrs.mp_nexthop else {
            return Err(CoreError::fatal("v6 announcement without MP next hop"));
        };
        let mut nets: Vec<Ipv6Net> = nets;
        while !nets.is_empty() {
            let mut packet = UpdatePacket::new();
            packet.attrs = attrs.to_attrs(as4);
            let mut reach = MpReachAttr {
                afi: Afi::Ip6,
                safi: Safi::Unicast,
                nexthop,
                nlri: MpNlri::Ipv6(Vec::new()),
            };
            loop {
                let Some(net) = nets.pop() else {
                    break;
                };
                if let MpNlri::Ipv6(list) = &mut reach.nlri {
                    list.push(net);
                }
                packet.mp_update = Some(reach.clone());
                if big_enough(&packet, as4) {
                    if let MpNlri::Ipv6(list) = &mut reach.nlri {
                        let overflow = list.pop().expect("just pushed");
                        if list.is_empty() {
                            return Err(CoreError::fatal(format!(
                                "single NLRI {} does not fit an UPDATE",
                                overflow
                            )));
                        }
                        nets.push(overflow);
                    }
                    packet.mp_update = Some(reach.clone());
                    break;
                }
            }
            packets.push(packet);
        }
    }

    Ok(packets)
}

fn big_enough(packet: &UpdatePacket, as4: bool) -> bool {
    packet.encoded_len(as4) > bgp_wire::BGP_PACKET_LEN
}

fn group_by_attrs<N>(announces: Vec<(N, Arc<PathAttrs>)>) -> Vec<(Arc<PathAttrs>, Vec<N>)> {
    let mut groups: Vec<(Arc<PathAttrs>, Vec<N>)> = Vec::new();
    for (net, attrs) in announces {
        match groups.iter_mut().find(|(a, _)| **a == *attrs) {
            Some((_, nets)) => nets.push(net),
            None => groups.push((attrs, vec![net])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgp_wire::{AsPath, NexthopAttr, Origin};

    fn attrs(asn: u32) -> Arc<PathAttrs> {
        let mut pa = PathAttrs::new();
        pa.origin = Some(Origin::Igp);
        pa.aspath = Some(AsPath::from_sequence([asn]));
        pa.nexthop = Some(NexthopAttr::new(Ipv4Addr::new(10, 0, 0, 1)));
        Arc::new(pa)
    }

    #[test]
    fn groups_share_one_update() {
        let mut batch = OutboundBatch::default();
        let a = attrs(65001);
        let b = attrs(65002);
        batch.announce4.push(("10.0.0.0/24".parse().unwrap(), a.clone()));
        batch.announce4.push(("10.0.1.0/24".parse().unwrap(), a));
        batch.announce4.push(("10.0.2.0/24".parse().unwrap(), b));
        batch.withdraw4.push("192.0.2.0/24".parse().unwrap());

        let packets = build_updates(batch, true).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].ipv4_withdraw.len(), 1);
        assert_eq!(packets[1].ipv4_update.len(), 2);
        assert_eq!(packets[2].ipv4_update.len(), 1);
        for packet in packets {
            assert!(packet.encode(true).is_ok());
        }
    }

    #[test]
    fn oversized_batch_splits() {
        let mut batch = OutboundBatch::default();
        let a = attrs(65001);
        for i in 0..1500u32 {
            let net: Ipv4Net = format!("10.{}.{}.0/24", i / 256, i % 256)
                .parse()
                .unwrap();
            batch.announce4.push((net, a.clone()));
        }
        let packets = build_updates(batch, true).unwrap();
        assert!(packets.len() > 1);
        let total: usize = packets.iter().map(|p| p.ipv4_update.len()).sum();
        assert_eq!(total, 1500);
        for packet in packets {
            assert!(packet.encode(true).is_ok());
        }
    }
}
