use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::PrefixMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::info;

use crate::context::HandlerGuard;

use super::api::{Message, RibRx};

/// Minimal unicast RIB: a longest-match table answering next-hop watch
/// requests from the protocol cores. Populated from configuration
/// (connected and static routes); every change re-answers the watchers
/// whose next hops it covers.
pub struct Rib {
    pub tx: UnboundedSender<Message>,
    pub rx: UnboundedReceiver<Message>,
    table4: PrefixMap<Ipv4Net, u32>,
    table6: PrefixMap<Ipv6Net, u32>,
    redists: BTreeMap<String, UnboundedSender<RibRx>>,
    watched: BTreeSet<IpAddr>,
}

impl Rib {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            table4: PrefixMap::new(),
            table6: PrefixMap::new(),
            redists: BTreeMap::new(),
            watched: BTreeSet::new(),
        }
    }

    pub fn route_add(&mut self, prefix: IpNet, metric: u32) {
        match prefix {
            IpNet::V4(net) => {
                self.table4.insert(net, metric);
            }
            IpNet::V6(net) => {
                self.table6.insert(net, metric);
            }
        }
        self.reanswer();
    }

    pub fn route_del(&mut self, prefix: &IpNet) {
        match prefix {
            IpNet::V4(net) => {
                self.table4.remove(net);
            }
            IpNet::V6(net) => {
                self.table6.remove(net);
            }
        }
        self.reanswer();
    }

    fn resolve(&self, addr: IpAddr) -> (bool, u32) {
        match addr {
            IpAddr::V4(v4) => {
                let net = Ipv4Net::new(v4, 32).unwrap();
                match self.table4.get_lpm(&net) {
                    Some((_, metric)) => (true, *metric),
                    None => (false, 0),
                }
            }
            IpAddr::V6(v6) => {
                let net = Ipv6Net::new(v6, 128).unwrap();
                match self.table6.get_lpm(&net) {
                    Some((_, metric)) => (true, *metric),
                    None => (false, 0),
                }
            }
        }
    }

    fn answer(&self, addr: IpAddr) {
        let (resolvable, metric) = self.resolve(addr);
        for tx in self.redists.values() {
            let _ = tx.send(RibRx::NhResult {
                addr,
                resolvable,
                metric,
            });
        }
    }

    fn reanswer(&self) {
        for addr in self.watched.iter() {
            self.answer(*addr);
        }
    }

    fn process_msg(&mut self, msg: Message) {
        let _guard = HandlerGuard::enter("rib");
        match msg {
            Message::Subscribe { proto, tx } => {
                let _ = tx.send(RibRx::EoR);
                self.redists.insert(proto, tx);
            }
            Message::NhRegister { addr } => {
                self.watched.insert(addr);
                self.answer(addr);
            }
            Message::NhDeregister { addr } => {
                self.watched.remove(&addr);
            }
        }
    }

    pub async fn event_loop(&mut self) {
        info!("rib started");
        while let Some(msg) = self.rx.recv().await {
            self.process_msg(msg);
        }
    }
}

impl Default for Rib {
    fn default() -> Self {
        Self::new()
    }
}

pub fn serve(mut rib: Rib) {
    tokio::spawn(async move {
        rib.event_loop().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_match_resolution() {
        let mut rib = Rib::new();
        rib.route_add("10.0.0.0/8".parse().unwrap(), 100);
        rib.route_add("10.1.0.0/16".parse().unwrap(), 10);

        let (ok, metric) = rib.resolve("10.1.2.3".parse().unwrap());
        assert!(ok);
        assert_eq!(metric, 10);

        let (ok, metric) = rib.resolve("10.2.0.1".parse().unwrap());
        assert!(ok);
        assert_eq!(metric, 100);

        let (ok, _) = rib.resolve("192.0.2.1".parse().unwrap());
        assert!(!ok);
    }
}
