use std::collections::BTreeMap;
use std::net::IpAddr;

/// What a single observer event did to its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Created,
    Changed,
    Deleted,
}

/// Interface-configuration events from the external observer. The MFEA
/// consumes these and projects them onto its own tree and MIF map; it
/// never talks to the platform interface plumbing itself.
#[derive(Debug, Clone)]
pub enum IfTreeEvent {
    TreeComplete,
    InterfaceUpdate {
        ifname: String,
        ifindex: u32,
        enabled: bool,
        mtu: u32,
        op: UpdateOp,
    },
    VifUpdate {
        ifname: String,
        vifname: String,
        pif_index: u32,
        multicast: bool,
        broadcast: bool,
        p2p: bool,
        loopback: bool,
        up: bool,
        op: UpdateOp,
    },
    Addr4Update {
        ifname: String,
        vifname: String,
        addr: IpAddr,
        prefix_len: u8,
        enabled: bool,
        op: UpdateOp,
    },
    Addr6Update {
        ifname: String,
        vifname: String,
        addr: IpAddr,
        prefix_len: u8,
        enabled: bool,
        op: UpdateOp,
    },
    UpdatesCompleted,
}

#[derive(Debug, Clone, Default)]
pub struct IfTreeAddr {
    pub addr: Option<IpAddr>,
    pub prefix_len: u8,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IfTreeVif {
    pub name: String,
    pub pif_index: u32,
    pub multicast: bool,
    pub broadcast: bool,
    pub p2p: bool,
    pub loopback: bool,
    pub up: bool,
    pub addrs: BTreeMap<IpAddr, IfTreeAddr>,
}

impl IfTreeVif {
    /// Enabled addresses, in insertion-independent (sorted) order. The
    /// MIF's address list is exactly this set.
    pub fn enabled_addrs(&self) -> Vec<(IpAddr, u8)> {
        self.addrs
            .values()
            .filter(|a| a.enabled)
            .filter_map(|a| a.addr.map(|addr| (addr, a.prefix_len)))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IfTreeInterface {
    pub name: String,
    pub ifindex: u32,
    pub enabled: bool,
    pub mtu: u32,
    pub vifs: BTreeMap<String, IfTreeVif>,
}

/// The MFEA's own projection of the system interface tree.
#[derive(Debug, Default)]
pub struct IfTree {
    pub interfaces: BTreeMap<String, IfTreeInterface>,
    pub complete: bool,
}

impl IfTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interface(&self, ifname: &str) -> Option<&IfTreeInterface> {
        self.interfaces.get(ifname)
    }

    pub fn vif(&self, ifname: &str, vifname: &str) -> Option<&IfTreeVif> {
        self.interfaces.get(ifname)?.vifs.get(vifname)
    }

    /// Apply one event to the projection. Returns false when the event
    /// referenced something the projection does not know.
    pub fn apply(&mut self, event: &IfTreeEvent) -> bool {
        match event {
            IfTreeEvent::TreeComplete => {
                self.complete = true;
                true
            }
            IfTreeEvent::InterfaceUpdate {
                ifname,
                ifindex,
                enabled,
                mtu,
                op,
            } => match op {
                UpdateOp::Created | UpdateOp::Changed => {
                    let entry = self
                        .interfaces
                        .entry(ifname.clone())
                        .or_insert_with(|| IfTreeInterface {
                            name: ifname.clone(),
                            ..Default::default()
                        });
                    entry.ifindex = *ifindex;
                    entry.enabled = *enabled;
                    entry.mtu = *mtu;
                    true
                }
                UpdateOp::Deleted => self.interfaces.remove(ifname).is_some(),
            },
            IfTreeEvent::VifUpdate {
                ifname,
                vifname,
                pif_index,
                multicast,
                broadcast,
                p2p,
                loopback,
                up,
                op,
            } => {
                let Some(iface) = self.interfaces.get_mut(ifname) else {
                    return false;
                };
                match op {
                    UpdateOp::Created | UpdateOp::Changed => {
                        let vif = iface
                            .vifs
                            .entry(vifname.clone())
                            .or_insert_with(|| IfTreeVif {
                                name: vifname.clone(),
                                ..Default::default()
                            });
                        vif.pif_index = *pif_index;
                        vif.multicast = *multicast;
                        vif.broadcast = *broadcast;
                        vif.p2p = *p2p;
                        vif.loopback = *loopback;
                        vif.up = *up;
                        true
                    }
                    UpdateOp::Deleted => iface.vifs.remove(vifname).is_some(),
                }
            }
            IfTreeEvent::Addr4Update {
                ifname,
                vifname,
                addr,
                prefix_len,
                enabled,
                op,
            }
            | IfTreeEvent::Addr6Update {
                ifname,
                vifname,
                addr,
                prefix_len,
                enabled,
                op,
            } => {
                let Some(vif) = self
                    .interfaces
                    .get_mut(ifname)
                    .and_then(|iface| iface.vifs.get_mut(vifname))
                else {
                    return false;
                };
                match op {
                    UpdateOp::Created | UpdateOp::Changed => {
                        vif.addrs.insert(
                            *addr,
                            IfTreeAddr {
                                addr: Some(*addr),
                                prefix_len: *prefix_len,
                                enabled: *enabled,
                            },
                        );
                        true
                    }
                    UpdateOp::Deleted => vif.addrs.remove(addr).is_some(),
                }
            }
            IfTreeEvent::UpdatesCompleted => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_follows_events() {
        let mut tree = IfTree::new();
        assert!(tree.apply(&IfTreeEvent::InterfaceUpdate {
            ifname: "eth0".into(),
            ifindex: 2,
            enabled: true,
            mtu: 1500,
            op: UpdateOp::Created,
        }));
        assert!(tree.apply(&IfTreeEvent::VifUpdate {
            ifname: "eth0".into(),
            vifname: "eth0".into(),
            pif_index: 2,
            multicast: true,
            broadcast: true,
            p2p: false,
            loopback: false,
            up: true,
            op: UpdateOp::Created,
        }));
        assert!(tree.apply(&IfTreeEvent::Addr4Update {
            ifname: "eth0".into(),
            vifname: "eth0".into(),
            addr: "10.0.0.1".parse().unwrap(),
            prefix_len: 24,
            enabled: true,
            op: UpdateOp::Created,
        }));
        let vif = tree.vif("eth0", "eth0").unwrap();
        assert_eq!(vif.enabled_addrs().len(), 1);

        // Events against unknown objects are refused.
        assert!(!tree.apply(&IfTreeEvent::VifUpdate {
            ifname: "eth9".into(),
            vifname: "eth9".into(),
            pif_index: 9,
            multicast: true,
            broadcast: true,
            p2p: false,
            loopback: false,
            up: true,
            op: UpdateOp::Created,
        }));
    }
}
