use std::fmt::Write;

use bgp_wire::BgpType;

use super::inst::Bgp;

/// `show bgp summary` style rendering of peer state and statistics.
pub fn show_summary(bgp: &Bgp) -> String {
    let mut buf = String::new();
    writeln!(
        buf,
        "BGP router identifier {}, local AS number {}",
        bgp.router_id, bgp.asn
    )
    .unwrap();
    writeln!(buf).unwrap();
    writeln!(
        buf,
        "{:<40} {:>10} {:>8} {:>8} {:>8} {:>12}",
        "Neighbor", "AS", "MsgRcvd", "MsgSent", "PfxRcd", "State"
    )
    .unwrap();
    for (addr, peer) in bgp.peers.iter() {
        let rcvd: u64 = peer.counter.iter().map(|c| c.rcvd).sum();
        let sent: u64 = peer.counter.iter().map(|c| c.sent).sum();
        let prefixes =
            bgp.pipeline4.ribin_route_count(peer.id) + bgp.pipeline6.ribin_route_count(peer.id);
        writeln!(
            buf,
            "{:<40} {:>10} {:>8} {:>8} {:>8} {:>12}",
            addr,
            peer.peer_as,
            rcvd,
            sent,
            prefixes,
            peer.state.to_str()
        )
        .unwrap();
    }
    buf
}

/// Per-peer detail including negotiated parameters and counters.
pub fn show_peer(bgp: &Bgp, addr: &std::net::IpAddr) -> String {
    let mut buf = String::new();
    let Some(peer) = bgp.peers.get(addr) else {
        writeln!(buf, "%% no such peer {}", addr).unwrap();
        return buf;
    };
    writeln!(
        buf,
        "BGP neighbor is {}, remote AS {}, {} link",
        addr,
        peer.peer_as,
        peer.peer_kind_str()
    )
    .unwrap();
    writeln!(buf, "  BGP state = {}", peer.state.to_str()).unwrap();
    writeln!(buf, "  Remote router ID {}", peer.remote_id).unwrap();
    writeln!(
        buf,
        "  Hold time is {}, keepalive interval is {} seconds",
        peer.param.hold_time, peer.param.keepalive
    )
    .unwrap();
    writeln!(
        buf,
        "  Established transitions: {}",
        peer.established_transitions
    )
    .unwrap();
    writeln!(buf, "  Message statistics:").unwrap();
    for (typ, name) in [
        (BgpType::Open, "Opens"),
        (BgpType::Update, "Updates"),
        (BgpType::Notification, "Notifications"),
        (BgpType::Keepalive, "Keepalives"),
    ] {
        let counter = peer.counter[typ as usize];
        writeln!(
            buf,
            "    {:<14} sent {:>8} rcvd {:>8}",
            name, counter.sent, counter.rcvd
        )
        .unwrap();
    }
    buf
}

impl super::peer::Peer {
    pub fn peer_kind_str(&self) -> &'static str {
        if self.is_ibgp() {
            "internal"
        } else {
            "external"
        }
    }
}
