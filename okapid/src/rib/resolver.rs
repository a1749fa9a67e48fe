use std::collections::BTreeMap;
use std::net::IpAddr;

use tokio::sync::mpsc::UnboundedSender;

use crate::bgp::route::AddressFamily;

use super::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    /// Cached answer available.
    Known { resolvable: bool, metric: u32 },
    /// Query outstanding; at most one per next hop.
    Pending,
}

#[derive(Debug, Default, Clone, Copy)]
struct NhEntry {
    resolvable: bool,
    metric: u32,
    answered: bool,
    refcount: u32,
}

/// Per-family next-hop watch table. Holds the refcounted registrations
/// from the BGP pipeline and the cached answers from the RIB; ensures a
/// single outstanding query per next hop.
#[derive(Debug)]
pub struct NextHopResolver<A: AddressFamily> {
    entries: BTreeMap<A::Addr, NhEntry>,
    rib_tx: Option<UnboundedSender<Message>>,
}

impl<A: AddressFamily> NextHopResolver<A> {
    pub fn new(rib_tx: Option<UnboundedSender<Message>>) -> Self {
        Self {
            entries: BTreeMap::new(),
            rib_tx,
        }
    }

    /// Register interest. Returns the cached state, issuing the single
    /// outstanding RIB query on first registration.
    pub fn register(&mut self, addr: A::Addr) -> LookupState {
        let entry = self.entries.entry(addr).or_default();
        entry.refcount += 1;
        if entry.answered {
            return LookupState::Known {
                resolvable: entry.resolvable,
                metric: entry.metric,
            };
        }
        if entry.refcount == 1 {
            if let Some(tx) = &self.rib_tx {
                let _ = tx.send(Message::NhRegister {
                    addr: A::to_ip(&addr),
                });
            }
        }
        LookupState::Pending
    }

    pub fn deregister(&mut self, addr: &A::Addr) {
        let Some(entry) = self.entries.get_mut(addr) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            self.entries.remove(addr);
            if let Some(tx) = &self.rib_tx {
                let _ = tx.send(Message::NhDeregister {
                    addr: A::to_ip(addr),
                });
            }
        }
    }

    /// Cached answer without registering.
    pub fn lookup(&self, addr: &A::Addr) -> Option<(bool, u32)> {
        self.entries
            .get(addr)
            .filter(|e| e.answered)
            .map(|e| (e.resolvable, e.metric))
    }

    pub fn metric(&self, addr: &A::Addr) -> Option<u32> {
        self.lookup(addr)
            .and_then(|(resolvable, metric)| resolvable.then_some(metric))
    }

    /// Feed an answer (or a change) from the RIB. Returns true when the
    /// recorded state changed, meaning dependents must be re-run.
    pub fn answer(&mut self, addr: IpAddr, resolvable: bool, metric: u32) -> Option<A::Addr> {
        let addr = A::from_ip(addr)?;
        let entry = self.entries.get_mut(&addr)?;
        let changed =
            !entry.answered || entry.resolvable != resolvable || entry.metric != metric;
        entry.answered = true;
        entry.resolvable = resolvable;
        entry.metric = metric;
        changed.then_some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::route::Ipv4Af;
    use std::net::Ipv4Addr;

    #[test]
    fn single_outstanding_query() {
        let mut resolver: NextHopResolver<Ipv4Af> = NextHopResolver::new(None);
        let nh = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(resolver.register(nh), LookupState::Pending);
        assert_eq!(resolver.register(nh), LookupState::Pending);

        let changed = resolver.answer(IpAddr::V4(nh), true, 20);
        assert_eq!(changed, Some(nh));
        assert_eq!(
            resolver.register(nh),
            LookupState::Known {
                resolvable: true,
                metric: 20
            }
        );

        // Same answer again is not a change.
        assert_eq!(resolver.answer(IpAddr::V4(nh), true, 20), None);
        // Metric change is.
        assert_eq!(resolver.answer(IpAddr::V4(nh), true, 30), Some(nh));

        resolver.deregister(&nh);
        resolver.deregister(&nh);
        resolver.deregister(&nh);
        assert_eq!(resolver.lookup(&nh), None);
    }
}
