use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use sysctl::Sysctl;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc::Sender;
use tracing::{error, info, warn};

use crate::context::Task;
use crate::error::{CoreError, Result};

use super::osdep::*;

/// Address family of one mrouter instance. One socket per family; UNIX
/// kernels allow a single multicast router per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn level(&self) -> libc::c_int {
        match self {
            Family::Ipv4 => libc::IPPROTO_IP,
            Family::Ipv6 => libc::IPPROTO_IPV6,
        }
    }

    pub fn domain(&self) -> libc::c_int {
        match self {
            Family::Ipv4 => libc::AF_INET,
            Family::Ipv6 => libc::AF_INET6,
        }
    }

    /// Protocol of the raw mrouter socket: IGMP for v4, ICMPv6 for v6.
    pub fn mrouter_ip_protocol(&self) -> libc::c_int {
        match self {
            Family::Ipv4 => libc::IPPROTO_IGMP,
            Family::Ipv6 => libc::IPPROTO_ICMPV6,
        }
    }

    pub fn forwarding_sysctl(&self) -> &'static str {
        match self {
            Family::Ipv4 => "net.ipv4.conf.all.mc_forwarding",
            Family::Ipv6 => "net.ipv6.conf.all.mc_forwarding",
        }
    }

    pub fn is_ipv4(&self) -> bool {
        *self == Family::Ipv4
    }
}

/// Which flavor of the multi-table interface the running kernel accepted.
/// Probed once at start and never re-decided at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableApi {
    /// MRT_TABLE / MRT6_TABLE accepted.
    NewTable,
    /// The hacked `mrt_sockopt_simple` payloads accepted.
    CompatSockopt,
    /// Single-table legacy kernel.
    #[default]
    SingleTable,
}

/// The cached result of kernel capability discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelCaps {
    pub table_api: TableApi,
    pub disable_wrongvif: bool,
    pub border_vif: bool,
    pub rp: bool,
    pub bw_upcall: bool,
}

/// Bitset over MIF indices 0..MAX_VIFS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mifset(pub u32);

impl Mifset {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, index: u32) {
        if (index as usize) < MAX_VIFS {
            self.0 |= 1 << index;
        }
    }

    pub fn clear(&mut self, index: u32) {
        if (index as usize) < MAX_VIFS {
            self.0 &= !(1 << index);
        }
    }

    pub fn test(&self, index: u32) -> bool {
        (index as usize) < MAX_VIFS && self.0 & (1 << index) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_VIFS as u32).filter(move |i| self.test(*i))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MfcKey {
    pub source: IpAddr,
    pub group: IpAddr,
}

/// What the kernel holds (or would hold) for one (S,G).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfcEntry {
    pub iif_vif_index: u32,
    pub oiflist: Mifset,
    pub oiflist_disable_wrongvif: Mifset,
    pub rp_addr: Option<IpAddr>,
}

/// The kernel-side view of one installed vif.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VifImage {
    pub pif_index: u32,
    pub addr: Option<IpAddr>,
    pub is_register: bool,
}

/// Counters per (S,G).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgCount {
    pub pktcnt: u64,
    pub bytecnt: u64,
    pub wrong_if: u64,
}

/// Counters per virtual interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct VifCount {
    pub icount: u64,
    pub ocount: u64,
    pub ibytes: u64,
    pub obytes: u64,
}

/// A parsed kernel upcall ready for demultiplexing.
#[derive(Debug, Clone)]
pub struct KernelSignal {
    pub message_type: KernelSignalType,
    pub vif_index: u32,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub payload: Vec<u8>,
}

/// The multicast-routing kernel access point: owns the per-family raw
/// socket, all MRT mutations go through it serially, and the user-space
/// MFC image it keeps is authoritative (the kernel is reconciled to it).
#[derive(Debug)]
pub struct MfeaMrouter {
    family: Family,
    table_id: u32,
    socket: Option<Arc<OwnedFd>>,
    caps: KernelCaps,
    mfc_image: BTreeMap<MfcKey, MfcEntry>,
    vif_image: BTreeMap<u32, VifImage>,
    /// Forwarding sysctl value found at start, restored on stop.
    saved_forwarding: Option<String>,
    upcall_task: Option<Task<()>>,
}

impl MfeaMrouter {
    pub fn new(family: Family, table_id: Option<u32>) -> Self {
        Self {
            family,
            table_id: table_id.unwrap_or(DEFAULT_MROUTE_TABLE),
            socket: None,
            caps: KernelCaps::default(),
            mfc_image: BTreeMap::new(),
            vif_image: BTreeMap::new(),
            saved_forwarding: None,
            upcall_task: None,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn caps(&self) -> KernelCaps {
        self.caps
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn mfc_image(&self) -> &BTreeMap<MfcKey, MfcEntry> {
        &self.mfc_image
    }

    pub fn vif_image(&self) -> &BTreeMap<u32, VifImage> {
        &self.vif_image
    }

    /// Open the socket, probe the table API, negotiate the advanced API
    /// and enable forwarding. `signal_tx` receives raw upcall datagrams.
    pub fn start(&mut self, signal_tx: Sender<super::inst::Message>) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        if !nix::unistd::Uid::effective().is_root() {
            warn!("mrouter socket normally requires root privileges");
        }
        let fd = unsafe {
            libc::socket(
                self.family.domain(),
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                self.family.mrouter_ip_protocol(),
            )
        };
        if fd < 0 {
            return Err(CoreError::kernel(format!(
                "mrouter socket: {}",
                io::Error::last_os_error()
            )));
        }
        let fd = Arc::new(unsafe { OwnedFd::from_raw_fd(fd) });
        self.socket = Some(fd.clone());

        self.save_and_enable_forwarding();
        self.start_mrt()?;
        self.configure_advanced_api();
        self.upcall_task = Some(start_upcall_reader(fd, signal_tx));
        info!(
            "mrouter started ({:?}), table api {:?}, caps {:?}",
            self.family, self.caps.table_api, self.caps
        );
        Ok(())
    }

    /// MRT_INIT with the table-API probe ladder: compat sockopt first,
    /// then the new MRT_TABLE, else legacy single table.
    fn start_mrt(&mut self) -> Result<()> {
        let version: u32 = 1;
        match self.family {
            Family::Ipv4 => {
                let compat = MrtSockoptSimple {
                    optval: version,
                    table_id: self.table_id,
                };
                if self.setsockopt(MRT_INIT, as_bytes(&compat)).is_ok() {
                    self.caps.table_api = TableApi::CompatSockopt;
                    return Ok(());
                }
                if self.setsockopt(MRT_TABLE, as_bytes(&self.table_id)).is_ok() {
                    self.caps.table_api = TableApi::NewTable;
                } else {
                    self.caps.table_api = TableApi::SingleTable;
                }
                self.setsockopt(MRT_INIT, as_bytes(&version))
                    .map_err(|e| CoreError::kernel(format!("MRT_INIT: {}", e)))
            }
            Family::Ipv6 => {
                if self.setsockopt(MRT6_TABLE, as_bytes(&self.table_id)).is_ok() {
                    self.caps.table_api = TableApi::NewTable;
                } else {
                    self.caps.table_api = TableApi::SingleTable;
                }
                self.setsockopt(MRT6_INIT, as_bytes(&version))
                    .map_err(|e| CoreError::kernel(format!("MRT6_INIT: {}", e)))
            }
        }
    }

    /// Request the advanced-API feature bits and record the granted set.
    fn configure_advanced_api(&mut self) {
        let wanted: u32 = MRT_MFC_FLAGS_DISABLE_WRONGVIF
            | MRT_MFC_FLAGS_BORDER_VIF
            | MRT_MFC_RP
            | MRT_MFC_BW_UPCALL;
        let mut granted = wanted;
        let opt = match self.family {
            Family::Ipv4 => MRT_API_CONFIG,
            // The v6 advanced API mirrors the v4 option block.
            Family::Ipv6 => MRT_API_CONFIG,
        };
        match self.setsockopt_inout(opt, &mut granted) {
            Ok(()) => {
                self.caps.disable_wrongvif = granted & MRT_MFC_FLAGS_DISABLE_WRONGVIF != 0;
                self.caps.border_vif = granted & MRT_MFC_FLAGS_BORDER_VIF != 0;
                self.caps.rp = granted & MRT_MFC_RP != 0;
                self.caps.bw_upcall = granted & MRT_MFC_BW_UPCALL != 0;
            }
            Err(err) => {
                // No advanced API at all; basic MFC management only.
                info!("MRT_API_CONFIG not supported: {}", err);
                self.caps.disable_wrongvif = false;
                self.caps.border_vif = false;
                self.caps.rp = false;
                self.caps.bw_upcall = false;
            }
        }
    }

    pub fn stop(&mut self) {
        if self.socket.is_some() {
            let done: u32 = 1;
            let result = match (self.family, self.caps.table_api) {
                (Family::Ipv4, TableApi::CompatSockopt) => {
                    let compat = MrtSockoptSimple {
                        optval: done,
                        table_id: self.table_id,
                    };
                    self.setsockopt(MRT_DONE, as_bytes(&compat))
                }
                (Family::Ipv4, _) => self.setsockopt(MRT_DONE, as_bytes(&done)),
                (Family::Ipv6, _) => self.setsockopt(MRT6_DONE, as_bytes(&done)),
            };
            if let Err(err) = result {
                warn!("MRT_DONE: {}", err);
            }
        }
        self.restore_forwarding();
        self.upcall_task = None;
        self.socket = None;
        self.mfc_image.clear();
        self.vif_image.clear();
    }

    fn save_and_enable_forwarding(&mut self) {
        let name = self.family.forwarding_sysctl();
        match sysctl::Ctl::new(name) {
            Ok(ctl) => {
                if let Ok(value) = ctl.value_string() {
                    self.saved_forwarding = Some(value);
                }
                if let Err(err) = ctl.set_value_string("1") {
                    warn!("sysctl {}=1: {}", name, err);
                }
            }
            Err(err) => warn!("sysctl {}: {}", name, err),
        }
    }

    fn restore_forwarding(&mut self) {
        let Some(saved) = self.saved_forwarding.take() else {
            return;
        };
        let name = self.family.forwarding_sysctl();
        match sysctl::Ctl::new(name) {
            Ok(ctl) => {
                if let Err(err) = ctl.set_value_string(&saved) {
                    warn!("sysctl {}={}: {}", name, saved, err);
                }
            }
            Err(err) => warn!("sysctl {}: {}", name, err),
        }
    }

    /// Install a multicast vif in the kernel.
    pub fn add_multicast_vif(
        &mut self,
        vif_index: u32,
        pif_index: u32,
        addr: Option<IpAddr>,
        is_register: bool,
        rate_limit: u32,
        ttl_threshold: u8,
    ) -> Result<()> {
        self.vif_image.insert(
            vif_index,
            VifImage {
                pif_index,
                addr,
                is_register,
            },
        );
        match self.family {
            Family::Ipv4 => {
                let mut vc = Vifctl {
                    vifc_vifi: vif_index as u16,
                    vifc_flags: 0,
                    vifc_threshold: ttl_threshold,
                    vifc_rate_limit: rate_limit,
                    vifc_lcl: 0,
                    vifc_rmt_addr: 0,
                };
                if is_register {
                    vc.vifc_flags |= VIFF_REGISTER;
                }
                // Prefer the ifindex form when the kernel has it; the
                // address form is the fallback for old kernels.
                match addr {
                    Some(IpAddr::V4(v4)) => {
                        vc.vifc_lcl = u32::from(v4).to_be();
                    }
                    _ => {
                        vc.vifc_flags |= VIFF_USE_IFINDEX;
                        vc.vifc_lcl = pif_index;
                    }
                }
                self.setsockopt(MRT_ADD_VIF, as_bytes(&vc))
                    .map_err(|e| CoreError::kernel(format!("MRT_ADD_VIF {}: {}", vif_index, e)))
            }
            Family::Ipv6 => {
                let mut mc = Mif6ctl {
                    mif6c_mifi: vif_index as u16,
                    mif6c_flags: 0,
                    vifc_threshold: ttl_threshold,
                    mif6c_pifi: pif_index as u16,
                    vifc_rate_limit: rate_limit,
                };
                if is_register {
                    mc.mif6c_flags |= MIFF_REGISTER;
                }
                self.setsockopt(MRT6_ADD_MIF, as_bytes(&mc))
                    .map_err(|e| CoreError::kernel(format!("MRT6_ADD_MIF {}: {}", vif_index, e)))
            }
        }
    }

    pub fn delete_multicast_vif(&mut self, vif_index: u32) -> Result<()> {
        self.vif_image.remove(&vif_index);
        match self.family {
            Family::Ipv4 => {
                let vc = Vifctl {
                    vifc_vifi: vif_index as u16,
                    ..Default::default()
                };
                self.setsockopt(MRT_DEL_VIF, as_bytes(&vc))
                    .map_err(|e| CoreError::kernel(format!("MRT_DEL_VIF {}: {}", vif_index, e)))
            }
            Family::Ipv6 => {
                let mifi: u16 = vif_index as u16;
                self.setsockopt(MRT6_DEL_MIF, as_bytes(&mifi))
                    .map_err(|e| CoreError::kernel(format!("MRT6_DEL_MIF {}: {}", vif_index, e)))
            }
        }
    }

    /// Install or modify the kernel MFC for (S,G). The image is updated
    /// first; a kernel EEXIST is idempotent success.
    pub fn add_mfc(
        &mut self,
        source: IpAddr,
        group: IpAddr,
        iif_vif_index: u32,
        oiflist: Mifset,
        oiflist_disable_wrongvif: Mifset,
        rp_addr: Option<IpAddr>,
    ) -> Result<()> {
        let key = MfcKey { source, group };
        let entry = MfcEntry {
            iif_vif_index,
            oiflist,
            oiflist_disable_wrongvif,
            rp_addr,
        };
        self.mfc_image.insert(key, entry);

        // Outgoing TTL array: members get the minimum TTL, the rest 0;
        // the optional per-oif flag array rides the advanced API.
        let mut ttls = [0u8; MAX_VIFS];
        let mut flags = [0u8; MAX_VIFS];
        for i in 0..MAX_VIFS as u32 {
            if oiflist.test(i) {
                ttls[i as usize] = MIN_TTL;
            }
            if oiflist_disable_wrongvif.test(i) && self.caps.disable_wrongvif {
                flags[i as usize] |= MRT_MFC_FLAGS_DISABLE_WRONGVIF as u8;
            }
        }

        let result = match (self.family, source, group) {
            (Family::Ipv4, IpAddr::V4(src), IpAddr::V4(grp)) => {
                if self.caps.disable_wrongvif || self.caps.rp {
                    let mut mc = Mfcctl2 {
                        mfcc_origin: u32::from(src).to_be(),
                        mfcc_mcastgrp: u32::from(grp).to_be(),
                        mfcc_parent: iif_vif_index as u16,
                        mfcc_ttls: ttls,
                        mfcc_flags: flags,
                        mfcc_rp: 0,
                    };
                    if self.caps.rp {
                        if let Some(IpAddr::V4(rp)) = rp_addr {
                            mc.mfcc_rp = u32::from(rp).to_be();
                        }
                    }
                    self.setsockopt(MRT_ADD_MFC, as_bytes(&mc))
                } else {
                    let mc = Mfcctl {
                        mfcc_origin: u32::from(src).to_be(),
                        mfcc_mcastgrp: u32::from(grp).to_be(),
                        mfcc_parent: iif_vif_index as u16,
                        mfcc_ttls: ttls,
                        ..Default::default()
                    };
                    self.setsockopt(MRT_ADD_MFC, as_bytes(&mc))
                }
            }
            (Family::Ipv6, IpAddr::V6(src), IpAddr::V6(grp)) => {
                let mut ifset = [0u32; 8];
                for i in oiflist.iter() {
                    ifset[(i / 32) as usize] |= 1 << (i % 32);
                }
                let mc = Mf6cctl {
                    mf6cc_origin: sockaddr_in6(src),
                    mf6cc_mcastgrp: sockaddr_in6(grp),
                    mf6cc_parent: iif_vif_index as u16,
                    mf6cc_ifset: ifset,
                };
                self.setsockopt(MRT6_ADD_MFC, as_bytes(&mc))
            }
            _ => {
                return Err(CoreError::config("MFC family mismatch"));
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => Ok(()),
            Err(err) => {
                // The intent stays in the image so reconfiguration can
                // retry coherently.
                warn!("MRT_ADD_MFC ({}, {}): {}", source, group, err);
                Ok(())
            }
        }
    }

    /// Remove the kernel MFC for (S,G); a kernel refusal is a warning.
    pub fn delete_mfc(&mut self, source: IpAddr, group: IpAddr) -> Result<()> {
        let key = MfcKey { source, group };
        self.mfc_image.remove(&key);

        let result = match (self.family, source, group) {
            (Family::Ipv4, IpAddr::V4(src), IpAddr::V4(grp)) => {
                let mc = Mfcctl {
                    mfcc_origin: u32::from(src).to_be(),
                    mfcc_mcastgrp: u32::from(grp).to_be(),
                    ..Default::default()
                };
                self.setsockopt(MRT_DEL_MFC, as_bytes(&mc))
            }
            (Family::Ipv6, IpAddr::V6(src), IpAddr::V6(grp)) => {
                let mc = Mf6cctl {
                    mf6cc_origin: sockaddr_in6(src),
                    mf6cc_mcastgrp: sockaddr_in6(grp),
                    mf6cc_parent: 0,
                    mf6cc_ifset: [0; 8],
                };
                self.setsockopt(MRT6_DEL_MFC, as_bytes(&mc))
            }
            _ => return Err(CoreError::config("MFC family mismatch")),
        };
        if let Err(err) = result {
            warn!("MRT_DEL_MFC ({}, {}): {}", source, group, err);
        }
        Ok(())
    }

    /// Install a kernel bandwidth-upcall filter. Only valid when the
    /// capability was granted; the userspace fallback lives in the
    /// dataflow table.
    pub fn add_bw_upcall(
        &mut self,
        source: IpAddr,
        group: IpAddr,
        threshold_interval: Duration,
        threshold_packets: Option<u32>,
        threshold_bytes: Option<u32>,
        is_geq: bool,
    ) -> Result<()> {
        if !self.caps.bw_upcall {
            return Err(CoreError::config(
                "kernel lacks bandwidth-upcall support",
            ));
        }
        let upcall = build_bw_upcall(
            source,
            group,
            threshold_interval,
            threshold_packets,
            threshold_bytes,
            is_geq,
            false,
        )?;
        let opt = match self.family {
            Family::Ipv4 => MRT_ADD_BW_UPCALL,
            Family::Ipv6 => MRT6_ADD_BW_UPCALL,
        };
        self.setsockopt(opt, as_bytes(&upcall))
            .map_err(|e| CoreError::kernel(format!("MRT_ADD_BW_UPCALL: {}", e)))
    }

    pub fn delete_bw_upcall(
        &mut self,
        source: IpAddr,
        group: IpAddr,
        threshold_interval: Duration,
        threshold_packets: Option<u32>,
        threshold_bytes: Option<u32>,
        is_geq: bool,
    ) -> Result<()> {
        if !self.caps.bw_upcall {
            return Ok(());
        }
        let upcall = build_bw_upcall(
            source,
            group,
            threshold_interval,
            threshold_packets,
            threshold_bytes,
            is_geq,
            false,
        )?;
        let opt = match self.family {
            Family::Ipv4 => MRT_DEL_BW_UPCALL,
            Family::Ipv6 => MRT6_DEL_BW_UPCALL,
        };
        if let Err(err) = self.setsockopt(opt, as_bytes(&upcall)) {
            warn!("MRT_DEL_BW_UPCALL: {}", err);
        }
        Ok(())
    }

    pub fn delete_all_bw_upcall(&mut self, source: IpAddr, group: IpAddr) -> Result<()> {
        if !self.caps.bw_upcall {
            return Ok(());
        }
        let mut upcall = build_bw_upcall(
            source,
            group,
            Duration::from_secs(0),
            Some(0),
            None,
            true,
            false,
        )?;
        upcall.bu_flags = BW_UPCALL_DELETE_ALL;
        let opt = match self.family {
            Family::Ipv4 => MRT_DEL_BW_UPCALL,
            Family::Ipv6 => MRT6_DEL_BW_UPCALL,
        };
        if let Err(err) = self.setsockopt(opt, as_bytes(&upcall)) {
            warn!("MRT_DEL_BW_UPCALL(all): {}", err);
        }
        Ok(())
    }

    /// SIOCGETSGCNT: forwarded packet/byte counters for one (S,G).
    pub fn get_sg_count(&self, source: IpAddr, group: IpAddr) -> Result<SgCount> {
        let Some(fd) = &self.socket else {
            return Err(CoreError::kernel("mrouter not started"));
        };
        match (source, group) {
            (IpAddr::V4(src), IpAddr::V4(grp)) => {
                let mut req = SiocSgReq {
                    src: u32::from(src).to_be(),
                    grp: u32::from(grp).to_be(),
                    ..Default::default()
                };
                let rc = unsafe {
                    libc::ioctl(
                        fd.as_raw_fd(),
                        SIOCGETSGCNT,
                        &mut req as *mut SiocSgReq,
                    )
                };
                if rc < 0 {
                    return Err(CoreError::kernel(format!(
                        "SIOCGETSGCNT: {}",
                        io::Error::last_os_error()
                    )));
                }
                Ok(SgCount {
                    pktcnt: req.pktcnt as u64,
                    bytecnt: req.bytecnt as u64,
                    wrong_if: req.wrong_if as u64,
                })
            }
            _ => Err(CoreError::config("sg-count family mismatch")),
        }
    }

    /// SIOCGETVIFCNT: per-vif counters.
    pub fn get_vif_count(&self, vif_index: u32) -> Result<VifCount> {
        let Some(fd) = &self.socket else {
            return Err(CoreError::kernel("mrouter not started"));
        };
        let mut req = SiocVifReq {
            vifi: vif_index as u16,
            ..Default::default()
        };
        let rc = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                SIOCGETVIFCNT,
                &mut req as *mut SiocVifReq,
            )
        };
        if rc < 0 {
            return Err(CoreError::kernel(format!(
                "SIOCGETVIFCNT: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(VifCount {
            icount: req.icount as u64,
            ocount: req.ocount as u64,
            ibytes: req.ibytes as u64,
            obytes: req.obytes as u64,
        })
    }

    /// Parse one upcall datagram from the kernel socket into a signal.
    /// WHOLEPKT messages carry the inner packet whose header names the
    /// real (S,G).
    pub fn kernel_call_process(&self, databuf: &[u8]) -> Result<KernelSignal> {
        match self.family {
            Family::Ipv4 => {
                let msg = Igmpmsg::parse(databuf)
                    .ok_or_else(|| CoreError::kernel("short igmpmsg upcall"))?;
                let message_type = KernelSignalType::try_from(msg.im_msgtype)
                    .map_err(|v| CoreError::kernel(format!("unknown upcall type {}", v)))?;
                let payload = databuf[IGMPMSG_SIZE..].to_vec();
                let (src, dst) = if message_type == KernelSignalType::WholePkt {
                    parse_inner_ipv4(&payload)
                        .map(|(s, d)| (IpAddr::V4(s), IpAddr::V4(d)))
                        .ok_or_else(|| CoreError::kernel("truncated WHOLEPKT payload"))?
                } else {
                    (IpAddr::V4(msg.src_addr()), IpAddr::V4(msg.dst_addr()))
                };
                Ok(KernelSignal {
                    message_type,
                    vif_index: msg.vif_index(),
                    src,
                    dst,
                    payload,
                })
            }
            Family::Ipv6 => {
                let msg = Mrt6msg::parse(databuf)
                    .ok_or_else(|| CoreError::kernel("short mrt6msg upcall"))?;
                let message_type = KernelSignalType::try_from(msg.im6_msgtype)
                    .map_err(|v| CoreError::kernel(format!("unknown upcall type {}", v)))?;
                let payload = databuf[MRT6MSG_SIZE..].to_vec();
                let (src, dst) = if message_type == KernelSignalType::WholePkt {
                    parse_inner_ipv6(&payload)
                        .map(|(s, d)| (IpAddr::V6(s), IpAddr::V6(d)))
                        .ok_or_else(|| CoreError::kernel("truncated WHOLEPKT payload"))?
                } else {
                    (IpAddr::V6(msg.src_addr()), IpAddr::V6(msg.dst_addr()))
                };
                Ok(KernelSignal {
                    message_type,
                    vif_index: msg.im6_mif as u32,
                    src,
                    dst,
                    payload,
                })
            }
        }
    }

    fn setsockopt(&self, opt: libc::c_int, payload: &[u8]) -> io::Result<()> {
        let Some(fd) = &self.socket else {
            // Detached mode (tests, dry runs): the image is the truth.
            return Ok(());
        };
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                self.family.level(),
                opt,
                payload.as_ptr() as *const libc::c_void,
                payload.len() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// setsockopt whose payload the kernel rewrites with the granted
    /// subset (MRT_API_CONFIG).
    fn setsockopt_inout(&self, opt: libc::c_int, value: &mut u32) -> io::Result<()> {
        let Some(fd) = &self.socket else {
            return Ok(());
        };
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                self.family.level(),
                opt,
                value as *mut u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MfeaMrouter {
    fn drop(&mut self) {
        if self.socket.is_some() {
            self.stop();
        }
    }
}

fn build_bw_upcall(
    source: IpAddr,
    group: IpAddr,
    threshold_interval: Duration,
    threshold_packets: Option<u32>,
    threshold_bytes: Option<u32>,
    is_geq: bool,
    _delete_all: bool,
) -> Result<BwUpcall> {
    let (IpAddr::V4(src), IpAddr::V4(grp)) = (source, group) else {
        return Err(CoreError::config("bw-upcall family mismatch"));
    };
    let mut flags = if is_geq { BW_UPCALL_GEQ } else { BW_UPCALL_LEQ };
    if threshold_packets.is_some() {
        flags |= BW_UPCALL_UNIT_PACKETS;
    }
    if threshold_bytes.is_some() {
        flags |= BW_UPCALL_UNIT_BYTES;
    }
    Ok(BwUpcall {
        bu_src: u32::from(src).to_be(),
        bu_dst: u32::from(grp).to_be(),
        bu_flags: flags,
        bu_threshold: BwData {
            b_time_sec: threshold_interval.as_secs() as i64,
            b_time_usec: threshold_interval.subsec_micros() as i64,
            b_packets: threshold_packets.unwrap_or(0) as u64,
            b_bytes: threshold_bytes.unwrap_or(0) as u64,
        },
        bu_measured: BwData::default(),
    })
}

fn sockaddr_in6(addr: Ipv6Addr) -> libc::sockaddr_in6 {
    let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_addr.s6_addr = addr.octets();
    sa
}

fn as_bytes<T>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

#[derive(Debug)]
struct UpcallFd(Arc<OwnedFd>);

impl AsRawFd for UpcallFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Upcall datagrams from the kernel are shipped into the node's event
/// loop for demultiplexing.
fn start_upcall_reader(fd: Arc<OwnedFd>, tx: Sender<super::inst::Message>) -> Task<()> {
    Task::spawn(async move {
        let async_fd = match AsyncFd::with_interest(UpcallFd(fd), Interest::READABLE) {
            Ok(async_fd) => async_fd,
            Err(err) => {
                error!("mrouter upcall reader: {}", err);
                return;
            }
        };
        let mut buf = vec![0u8; 8192];
        loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    error!("mrouter upcall wait: {}", err);
                    return;
                }
            };
            let raw = async_fd.get_ref().as_raw_fd();
            let rc = unsafe {
                libc::recv(
                    raw,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    guard.clear_ready();
                    continue;
                }
                error!("mrouter upcall recv: {}", err);
                return;
            }
            let datagram = buf[..rc as usize].to_vec();
            if tx
                .send(super::inst::Message::KernelUpcall(datagram))
                .await
                .is_err()
            {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mifset_bits() {
        let mut set = Mifset::new();
        set.set(0);
        set.set(2);
        set.set(31);
        assert!(set.test(0) && set.test(2) && set.test(31));
        assert!(!set.test(1));
        set.clear(2);
        assert!(!set.test(2));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 31]);
    }

    #[test]
    fn detached_image_is_authoritative() {
        let mut mrouter = MfeaMrouter::new(Family::Ipv4, None);
        let source: IpAddr = "192.0.2.1".parse().unwrap();
        let group: IpAddr = "239.1.1.1".parse().unwrap();
        let mut oiflist = Mifset::new();
        oiflist.set(1);
        mrouter
            .add_mfc(source, group, 0, oiflist, Mifset::new(), None)
            .unwrap();
        let key = MfcKey { source, group };
        assert_eq!(mrouter.mfc_image().get(&key).unwrap().oiflist, oiflist);
        mrouter.delete_mfc(source, group).unwrap();
        assert!(mrouter.mfc_image().get(&key).is_none());
    }

    #[test]
    fn upcall_parse_v4() {
        let mrouter = MfeaMrouter::new(Family::Ipv4, None);
        let mut buf = vec![0u8; IGMPMSG_SIZE];
        buf[8] = IGMPMSG_WRONGVIF;
        buf[10] = 3;
        buf[12..16].copy_from_slice(&[192, 0, 2, 9]);
        buf[16..20].copy_from_slice(&[239, 0, 0, 1]);
        let signal = mrouter.kernel_call_process(&buf).unwrap();
        assert_eq!(signal.message_type, KernelSignalType::WrongVif);
        assert_eq!(signal.vif_index, 3);
        assert_eq!(signal.src, "192.0.2.9".parse::<IpAddr>().unwrap());
        assert_eq!(signal.dst, "239.0.0.1".parse::<IpAddr>().unwrap());

        // An unknown message type is rejected by the enum.
        let mut bad = buf.clone();
        bad[8] = 9;
        assert!(mrouter.kernel_call_process(&bad).is_err());
    }

    #[test]
    fn upcall_parse_wholepkt_inner_header() {
        let mrouter = MfeaMrouter::new(Family::Ipv4, None);
        let mut buf = vec![0u8; IGMPMSG_SIZE + 20];
        buf[8] = IGMPMSG_WHOLEPKT;
        buf[IGMPMSG_SIZE] = 0x45;
        buf[IGMPMSG_SIZE + 12..IGMPMSG_SIZE + 16].copy_from_slice(&[10, 0, 0, 7]);
        buf[IGMPMSG_SIZE + 16..IGMPMSG_SIZE + 20].copy_from_slice(&[239, 1, 2, 3]);
        let signal = mrouter.kernel_call_process(&buf).unwrap();
        assert_eq!(signal.message_type, KernelSignalType::WholePkt);
        assert_eq!(signal.src, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(signal.dst, "239.1.2.3".parse::<IpAddr>().unwrap());
    }
}
