use std::net::IpAddr;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Requests into the RIB from protocol subsystems.
#[derive(Debug)]
pub enum Message {
    Subscribe {
        proto: String,
        tx: UnboundedSender<RibRx>,
    },
    /// Start watching resolvability of a next hop.
    NhRegister { addr: IpAddr },
    /// Stop watching; refcounts are the caller's business.
    NhDeregister { addr: IpAddr },
}

/// Notifications out of the RIB.
#[derive(Debug, Clone)]
pub enum RibRx {
    /// Answer to NhRegister, and re-sent whenever the answer changes.
    NhResult {
        addr: IpAddr,
        resolvable: bool,
        metric: u32,
    },
    /// End of initial dump.
    EoR,
}

#[derive(Debug)]
pub struct RibRxChannel {
    pub tx: UnboundedSender<RibRx>,
    pub rx: UnboundedReceiver<RibRx>,
}

impl RibRxChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

impl Default for RibRxChannel {
    fn default() -> Self {
        Self::new()
    }
}
