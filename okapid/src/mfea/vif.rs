use std::fmt;
use std::net::IpAddr;

use bitflags::bitflags;

use crate::error::{CoreError, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VifFlags: u16 {
        const PIM_REGISTER = 0x01;
        const P2P = 0x02;
        const LOOPBACK = 0x04;
        const MULTICAST_CAPABLE = 0x08;
        const BROADCAST_CAPABLE = 0x10;
        const UNDERLYING_UP = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VifAddr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

/// One logical multicast interface. At most one protocol instance may be
/// registered on a MIF at a time.
#[derive(Debug, Clone)]
pub struct MfeaVif {
    pub name: String,
    pub ifname: String,
    pub vif_index: u32,
    pub pif_index: u32,
    pub addrs: Vec<VifAddr>,
    pub min_ttl_threshold: u8,
    pub max_rate_limit: u32,
    pub flags: VifFlags,
    /// Copied from the chosen underlying vif when a register vif is
    /// created; deliberately never refreshed afterwards.
    pub mtu: u32,
    pub enabled: bool,
    pub up: bool,
    registered: Option<(String, u8)>,
}

impl MfeaVif {
    pub fn new(name: &str, ifname: &str, vif_index: u32, pif_index: u32) -> Self {
        Self {
            name: name.to_string(),
            ifname: ifname.to_string(),
            vif_index,
            pif_index,
            addrs: Vec::new(),
            min_ttl_threshold: 1,
            max_rate_limit: 0,
            flags: VifFlags::default(),
            mtu: 0,
            enabled: false,
            up: false,
            registered: None,
        }
    }

    pub fn is_pim_register(&self) -> bool {
        self.flags.contains(VifFlags::PIM_REGISTER)
    }

    pub fn is_underlying_up(&self) -> bool {
        self.flags.contains(VifFlags::UNDERLYING_UP)
    }

    pub fn is_multicast_capable(&self) -> bool {
        self.flags.contains(VifFlags::MULTICAST_CAPABLE)
    }

    /// The address the kernel vif binds to.
    pub fn primary_addr(&self) -> Option<IpAddr> {
        self.addrs.first().map(|a| a.addr)
    }

    pub fn add_addr(&mut self, addr: IpAddr, prefix_len: u8) {
        if !self.addrs.iter().any(|a| a.addr == addr) {
            self.addrs.push(VifAddr { addr, prefix_len });
        }
    }

    pub fn del_addr(&mut self, addr: &IpAddr) {
        self.addrs.retain(|a| a.addr != *addr);
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.up = false;
    }

    /// Preconditions for actually installing the kernel vif.
    pub fn can_start(&self) -> Result<()> {
        if !self.enabled {
            return Err(CoreError::config(format!("vif {} is disabled", self.name)));
        }
        if self.up {
            return Err(CoreError::config(format!("vif {} already started", self.name)));
        }
        if self.primary_addr().is_none() && !self.is_pim_register() {
            return Err(CoreError::config(format!("vif {} has no address", self.name)));
        }
        Ok(())
    }

    pub fn register_protocol(&mut self, module: &str, ip_protocol: u8) -> Result<()> {
        if let Some((existing, _)) = &self.registered {
            return Err(CoreError::config(format!(
                "vif {} already registered to {}",
                self.name, existing
            )));
        }
        self.registered = Some((module.to_string(), ip_protocol));
        Ok(())
    }

    pub fn unregister_protocol(&mut self, module: &str) -> Result<()> {
        match &self.registered {
            Some((existing, _)) if existing == module => {
                self.registered = None;
                Ok(())
            }
            Some((existing, _)) => Err(CoreError::config(format!(
                "vif {} is registered to {}, not {}",
                self.name, existing, module
            ))),
            None => Err(CoreError::config(format!(
                "vif {} has no registered protocol",
                self.name
            ))),
        }
    }

    pub fn registered_module(&self) -> Option<&str> {
        self.registered.as_ref().map(|(module, _)| module.as_str())
    }
}

impl fmt::Display for MfeaVif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vif {} index {} pif {}",
            self.name, self.vif_index, self.pif_index
        )?;
        let mut flags = Vec::new();
        if self.is_pim_register() {
            flags.push("PIM_REGISTER");
        }
        if self.flags.contains(VifFlags::P2P) {
            flags.push("P2P");
        }
        if self.flags.contains(VifFlags::LOOPBACK) {
            flags.push("LOOPBACK");
        }
        if self.is_multicast_capable() {
            flags.push("MULTICAST");
        }
        if self.flags.contains(VifFlags::BROADCAST_CAPABLE) {
            flags.push("BROADCAST");
        }
        if self.is_underlying_up() {
            flags.push("UNDERLYING_UP");
        }
        write!(f, " <{}>", flags.join(","))?;
        if self.up {
            write!(f, " UP")?;
        }
        for addr in self.addrs.iter() {
            write!(f, " {}/{}", addr.addr, addr.prefix_len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_registration() {
        let mut vif = MfeaVif::new("eth0", "eth0", 0, 2);
        vif.register_protocol("pim", 103).unwrap();
        assert!(vif.register_protocol("dvmrp", 2).is_err());
        assert!(vif.unregister_protocol("dvmrp").is_err());
        vif.unregister_protocol("pim").unwrap();
        assert!(vif.registered_module().is_none());
    }

    #[test]
    fn start_preconditions() {
        let mut vif = MfeaVif::new("eth0", "eth0", 0, 2);
        assert!(vif.can_start().is_err());
        vif.enable();
        assert!(vif.can_start().is_err()); // no address
        vif.add_addr("10.0.0.1".parse().unwrap(), 24);
        assert!(vif.can_start().is_ok());
    }
}
