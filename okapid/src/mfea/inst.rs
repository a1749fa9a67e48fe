use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{info, warn};

use crate::context::{HandlerGuard, Timer};
use crate::error::{CoreError, Result};

use super::dataflow::{DataflowUpcall, MfeaDft};
use super::iftree::{IfTree, IfTreeEvent, UpdateOp};
use super::mrouter::{Family, KernelSignal, MfcKey, MfeaMrouter, Mifset, SgCount, VifCount};
use super::osdep::{KernelSignalType, MAX_VIFS};
use super::vif::{MfeaVif, VifFlags};

/// Distances 0..MAX_DISTANCE let several protocols propose the same
/// (S,G); the lowest distance is what the kernel runs.
pub const MAX_DISTANCE: u32 = 8;

/// One protocol module's desired MFC entry, kept even while dormant.
#[derive(Debug, Clone)]
pub struct MfeaRouteStorage {
    pub distance: u32,
    pub module_instance_name: String,
    pub source: IpAddr,
    pub group: IpAddr,
    pub form: RouteForm,
}

/// Binary form names vifs by index and bitset; text form by vif name,
/// resolved at install time.
#[derive(Debug, Clone)]
pub enum RouteForm {
    Binary {
        iif_vif_index: u32,
        oiflist: Mifset,
        oiflist_disable_wrongvif: Mifset,
        rp_addr: Option<IpAddr>,
    },
    Text {
        iif_name: String,
        oif_names: Vec<String>,
    },
}

/// Signals delivered to registered protocol instances; the module name
/// routes them over the external RPC layer.
#[derive(Debug, Clone)]
pub enum ProtocolSignal {
    Kernel {
        message_type: KernelSignalType,
        vif_index: u32,
        src: IpAddr,
        dst: IpAddr,
        payload: Vec<u8>,
    },
    Dataflow(DataflowUpcall),
}

#[derive(Debug)]
struct RegisteredModule {
    ip_protocol: u8,
    tx: Sender<ProtocolSignal>,
}

/// Control-plane wishes for vifs not observed yet: a start request on an
/// unknown vif defers instead of failing.
#[derive(Debug, Clone, Copy, Default)]
struct VifPermInfo {
    should_enable: bool,
    should_start: bool,
}

#[derive(Debug)]
pub enum Message {
    StartNode,
    StopNode,
    IfEvent(IfTreeEvent),
    RegisterProtocol {
        module_instance_name: String,
        ifname: String,
        vifname: String,
        ip_protocol: u8,
        tx: Sender<ProtocolSignal>,
    },
    UnregisterProtocol {
        module_instance_name: String,
        ifname: String,
        vifname: String,
    },
    EnableVif(String),
    DisableVif(String),
    StartVif(String),
    StopVif(String),
    AddMfc {
        module_instance_name: String,
        source: IpAddr,
        group: IpAddr,
        distance: u32,
        form: RouteForm,
    },
    DeleteMfc {
        module_instance_name: String,
        source: IpAddr,
        group: IpAddr,
    },
    AddDataflowMonitor {
        module_instance_name: String,
        source: IpAddr,
        group: IpAddr,
        threshold_interval: Duration,
        threshold_packets: Option<u32>,
        threshold_bytes: Option<u32>,
        is_geq: bool,
        is_leq: bool,
    },
    DeleteDataflowMonitor {
        module_instance_name: String,
        source: IpAddr,
        group: IpAddr,
        threshold_interval: Duration,
        threshold_packets: Option<u32>,
        threshold_bytes: Option<u32>,
        is_geq: bool,
    },
    KernelUpcall(Vec<u8>),
    DataflowTick,
    Show(Sender<String>),
}

/// The MFEA node: composes the kernel access point, the MIF map, the
/// interface-tree projection, the registered protocol set, the
/// distance-keyed desired-route store and the dataflow table.
pub struct MfeaNode {
    family: Family,
    pub mrouter: MfeaMrouter,
    vifs: BTreeMap<String, MfeaVif>,
    by_index: BTreeMap<u32, String>,
    iftree: IfTree,
    perm: BTreeMap<String, VifPermInfo>,
    registered: BTreeMap<String, RegisteredModule>,
    routes: Vec<BTreeMap<(IpAddr, IpAddr), MfeaRouteStorage>>,
    pub dft: MfeaDft,
    tick_count: u64,
    pub tx: Sender<Message>,
    rx: Receiver<Message>,
    running: bool,
    dataflow_timer: Option<Timer>,
}

impl MfeaNode {
    pub fn new(family: Family, table_id: Option<u32>) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        Self {
            family,
            mrouter: MfeaMrouter::new(family, table_id),
            vifs: BTreeMap::new(),
            by_index: BTreeMap::new(),
            iftree: IfTree::new(),
            perm: BTreeMap::new(),
            registered: BTreeMap::new(),
            routes: (0..MAX_DISTANCE).map(|_| BTreeMap::new()).collect(),
            dft: MfeaDft::new(),
            tick_count: 0,
            tx,
            rx,
            running: false,
            dataflow_timer: None,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn vif_by_name(&self, name: &str) -> Option<&MfeaVif> {
        self.vifs.get(name)
    }

    pub fn vif_by_index(&self, index: u32) -> Option<&MfeaVif> {
        self.by_index.get(&index).and_then(|name| self.vifs.get(name))
    }

    pub fn start_node(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.mrouter.start(self.tx.clone())?;
        self.running = true;
        Ok(())
    }

    pub fn stop_node(&mut self) {
        if !self.running {
            return;
        }
        let names: Vec<String> = self.vifs.keys().cloned().collect();
        for name in names {
            let _ = self.stop_vif(&name);
        }
        self.mrouter.stop();
        self.running = false;
    }

    fn next_free_vif_index(&self) -> Option<u32> {
        (0..MAX_VIFS as u32).find(|index| !self.by_index.contains_key(index))
    }

    /// -- interface mirror -------------------------------------------------

    pub fn process_iftree_event(&mut self, event: IfTreeEvent) {
        match &event {
            IfTreeEvent::VifUpdate {
                ifname,
                vifname,
                op: UpdateOp::Deleted,
                ..
            } => {
                // Unregister anything bound to the vif first, then the
                // kernel MIF, then the projection.
                let ifname = ifname.clone();
                let vifname = vifname.clone();
                self.vif_deleted(&ifname, &vifname);
                self.iftree.apply(&event);
                return;
            }
            IfTreeEvent::InterfaceUpdate {
                ifname,
                op: UpdateOp::Deleted,
                ..
            } => {
                let vifnames: Vec<String> = self
                    .iftree
                    .interface(ifname)
                    .map(|iface| iface.vifs.keys().cloned().collect())
                    .unwrap_or_default();
                let ifname = ifname.clone();
                for vifname in vifnames {
                    self.vif_deleted(&ifname, &vifname);
                }
                self.iftree.apply(&event);
                return;
            }
            _ => {}
        }

        if !self.iftree.apply(&event) {
            warn!("interface event for unknown object: {:?}", event);
            return;
        }

        match event {
            IfTreeEvent::VifUpdate {
                ifname,
                vifname,
                op: UpdateOp::Created,
                ..
            } => {
                self.vif_created(&ifname, &vifname);
            }
            IfTreeEvent::VifUpdate {
                ifname,
                vifname,
                op: UpdateOp::Changed,
                ..
            } => {
                self.vif_changed(&ifname, &vifname);
            }
            IfTreeEvent::Addr4Update { ifname, vifname, .. }
            | IfTreeEvent::Addr6Update { ifname, vifname, .. } => {
                self.vif_addrs_changed(&ifname, &vifname);
            }
            _ => {}
        }
    }

    /// New vif observed: allocate the next free MIF index, create the
    /// configured vif, and honor any deferred wish.
    fn vif_created(&mut self, ifname: &str, vifname: &str) {
        if self.vifs.contains_key(vifname) {
            self.sync_vif_from_tree(ifname, vifname);
            return;
        }
        let Some(vif_index) = self.next_free_vif_index() else {
            warn!("no free vif index for {}", vifname);
            return;
        };
        let Some(tree_vif) = self.iftree.vif(ifname, vifname) else {
            return;
        };
        let mut vif = MfeaVif::new(vifname, ifname, vif_index, tree_vif.pif_index);
        if let Some(iface) = self.iftree.interface(ifname) {
            vif.mtu = iface.mtu;
        }
        self.vifs.insert(vifname.to_string(), vif);
        self.by_index.insert(vif_index, vifname.to_string());
        self.sync_vif_from_tree(ifname, vifname);

        let wish = self.perm.get(vifname).copied().unwrap_or_default();
        if wish.should_enable {
            if let Some(vif) = self.vifs.get_mut(vifname) {
                vif.enable();
            }
        }
        if wish.should_start {
            if let Err(err) = self.start_vif(vifname) {
                warn!("deferred start of {}: {}", vifname, err);
            }
        }
    }

    /// Project flags and addresses from the observed tree onto the MIF.
    fn sync_vif_from_tree(&mut self, ifname: &str, vifname: &str) {
        let Some(tree_vif) = self.iftree.vif(ifname, vifname) else {
            return;
        };
        let addrs = tree_vif.enabled_addrs();
        let (multicast, broadcast, p2p, loopback, up, pif_index) = (
            tree_vif.multicast,
            tree_vif.broadcast,
            tree_vif.p2p,
            tree_vif.loopback,
            tree_vif.up,
            tree_vif.pif_index,
        );
        let Some(vif) = self.vifs.get_mut(vifname) else {
            return;
        };
        vif.pif_index = pif_index;
        vif.flags.set(VifFlags::MULTICAST_CAPABLE, multicast);
        vif.flags.set(VifFlags::BROADCAST_CAPABLE, broadcast);
        vif.flags.set(VifFlags::P2P, p2p);
        vif.flags.set(VifFlags::LOOPBACK, loopback);
        vif.flags.set(VifFlags::UNDERLYING_UP, up);
        vif.addrs.clear();
        for (addr, prefix_len) in addrs {
            vif.add_addr(addr, prefix_len);
        }
    }

    fn vif_changed(&mut self, ifname: &str, vifname: &str) {
        let old_primary = self
            .vifs
            .get(vifname)
            .and_then(|vif| vif.primary_addr());
        let was_up = self.vifs.get(vifname).map(|vif| vif.up).unwrap_or(false);
        self.sync_vif_from_tree(ifname, vifname);
        let new_primary = self
            .vifs
            .get(vifname)
            .and_then(|vif| vif.primary_addr());
        // A primary-address move on a running MIF needs a kernel
        // reinstall: stop then start.
        if was_up && old_primary != new_primary {
            if let Err(err) = self.stop_vif(vifname) {
                warn!("restart of {}: {}", vifname, err);
                return;
            }
            if let Err(err) = self.start_vif(vifname) {
                warn!("restart of {}: {}", vifname, err);
            }
            return;
        }
        // A deferred start wish retries whenever the observed state
        // moves (e.g. the first address arriving).
        let should_start = self
            .perm
            .get(vifname)
            .map(|wish| wish.should_start)
            .unwrap_or(false);
        let startable = self
            .vifs
            .get(vifname)
            .map(|vif| !vif.up && vif.enabled)
            .unwrap_or(false);
        if should_start && startable {
            // May still not be startable; the wish stays recorded.
            let _ = self.start_vif(vifname);
        }
    }

    fn vif_addrs_changed(&mut self, ifname: &str, vifname: &str) {
        self.vif_changed(ifname, vifname);
    }

    fn vif_deleted(&mut self, _ifname: &str, vifname: &str) {
        let Some(vif) = self.vifs.get(vifname) else {
            return;
        };
        let vif_index = vif.vif_index;
        // Registered protocols go first, then the kernel MIF, then the
        // projection entry.
        if let Some(module) = vif.registered_module().map(str::to_string) {
            let _ = self.unregister_protocol(&module, vifname);
        }
        let _ = self.stop_vif(vifname);
        self.vifs.remove(vifname);
        self.by_index.remove(&vif_index);
    }

    /// -- vif lifecycle ----------------------------------------------------

    pub fn enable_vif(&mut self, vifname: &str) {
        self.perm.entry(vifname.to_string()).or_default().should_enable = true;
        if let Some(vif) = self.vifs.get_mut(vifname) {
            vif.enable();
        }
    }

    pub fn disable_vif(&mut self, vifname: &str) {
        self.perm.entry(vifname.to_string()).or_default().should_enable = false;
        let _ = self.stop_vif(vifname);
        if let Some(vif) = self.vifs.get_mut(vifname) {
            vif.disable();
        }
    }

    /// Start the MIF: install it in the kernel. A request against a vif
    /// not yet observed is remembered, not failed.
    pub fn start_vif(&mut self, vifname: &str) -> Result<()> {
        let wish = self.perm.entry(vifname.to_string()).or_default();
        wish.should_start = true;

        let Some(vif) = self.vifs.get(vifname) else {
            info!("start of unobserved vif {} deferred", vifname);
            return Ok(());
        };
        if !vif.enabled {
            // should_enable wish also implies starting later.
            return Err(CoreError::config(format!("vif {} is disabled", vifname)));
        }
        vif.can_start()?;

        let (vif_index, is_register) = (vif.vif_index, vif.is_pim_register());
        // A register vif borrows a valid pif index from some other up
        // interface to satisfy kernel sanity checks.
        let pif_index = if is_register {
            self.borrow_pif_index().unwrap_or(vif.pif_index)
        } else {
            vif.pif_index
        };
        let addr = vif.primary_addr();
        let rate_limit = vif.max_rate_limit;
        let ttl = vif.min_ttl_threshold;

        self.mrouter
            .add_multicast_vif(vif_index, pif_index, addr, is_register, rate_limit, ttl)?;
        if let Some(vif) = self.vifs.get_mut(vifname) {
            vif.up = true;
        }
        info!("vif {} started (index {})", vifname, vif_index);
        Ok(())
    }

    pub fn stop_vif(&mut self, vifname: &str) -> Result<()> {
        if let Some(wish) = self.perm.get_mut(vifname) {
            wish.should_start = false;
        }
        let Some(vif) = self.vifs.get(vifname) else {
            return Ok(());
        };
        if !vif.up {
            return Ok(());
        }
        let vif_index = vif.vif_index;
        let _ = self.mrouter.delete_multicast_vif(vif_index);
        if let Some(vif) = self.vifs.get_mut(vifname) {
            vif.up = false;
        }
        Ok(())
    }

    fn borrow_pif_index(&self) -> Option<u32> {
        self.vifs
            .values()
            .find(|vif| !vif.is_pim_register() && vif.is_underlying_up() && vif.pif_index != 0)
            .map(|vif| vif.pif_index)
    }

    /// -- protocol registration -------------------------------------------

    pub fn register_protocol(
        &mut self,
        module_instance_name: &str,
        vifname: &str,
        ip_protocol: u8,
        tx: Sender<ProtocolSignal>,
    ) -> Result<()> {
        let Some(vif) = self.vifs.get_mut(vifname) else {
            return Err(CoreError::config(format!("no such vif {}", vifname)));
        };
        vif.register_protocol(module_instance_name, ip_protocol)?;
        self.registered.insert(
            module_instance_name.to_string(),
            RegisteredModule {
                ip_protocol,
                tx,
            },
        );
        Ok(())
    }

    pub fn unregister_protocol(&mut self, module_instance_name: &str, vifname: &str) -> Result<()> {
        if let Some(vif) = self.vifs.get_mut(vifname) {
            vif.unregister_protocol(module_instance_name)?;
        }
        // The module stays registered for signals while it is bound to
        // any other vif.
        let still_bound = self
            .vifs
            .values()
            .any(|vif| vif.registered_module() == Some(module_instance_name));
        if !still_bound {
            self.registered.remove(module_instance_name);
        }
        Ok(())
    }

    /// -- MFC management ---------------------------------------------------

    fn resolve_form(
        &self,
        form: &RouteForm,
    ) -> Result<(u32, Mifset, Mifset, Option<IpAddr>)> {
        match form {
            RouteForm::Binary {
                iif_vif_index,
                oiflist,
                oiflist_disable_wrongvif,
                rp_addr,
            } => Ok((*iif_vif_index, *oiflist, *oiflist_disable_wrongvif, *rp_addr)),
            RouteForm::Text {
                iif_name,
                oif_names,
            } => {
                let iif = self
                    .vifs
                    .get(iif_name)
                    .ok_or_else(|| CoreError::config(format!("no iif vif {}", iif_name)))?;
                let mut oiflist = Mifset::new();
                for name in oif_names {
                    let vif = self
                        .vifs
                        .get(name)
                        .ok_or_else(|| CoreError::config(format!("no oif vif {}", name)))?;
                    oiflist.set(vif.vif_index);
                }
                Ok((iif.vif_index, oiflist, Mifset::new(), None))
            }
        }
    }

    /// Store the module's proposal at its distance and reconcile the
    /// kernel: the lowest-distance proposal per (S,G) is what runs.
    pub fn add_mfc(
        &mut self,
        module_instance_name: &str,
        source: IpAddr,
        group: IpAddr,
        distance: u32,
        form: RouteForm,
    ) -> Result<()> {
        if distance >= MAX_DISTANCE {
            return Err(CoreError::config(format!(
                "distance {} is above the maximum {}",
                distance, MAX_DISTANCE
            )));
        }
        let storage = MfeaRouteStorage {
            distance,
            module_instance_name: module_instance_name.to_string(),
            source,
            group,
            form,
        };
        self.routes[distance as usize].insert((source, group), storage);

        // A lower-distance proposal already runs; the new one is dormant.
        for lower in 0..distance {
            if self.routes[lower as usize].contains_key(&(source, group)) {
                info!(
                    "mfc ({}, {}): lower-distance {} proposal stays installed",
                    source, group, lower
                );
                return Ok(());
            }
        }

        self.install_mfc(source, group, distance)
    }

    fn install_mfc(&mut self, source: IpAddr, group: IpAddr, distance: u32) -> Result<()> {
        let Some(storage) = self.routes[distance as usize]
            .get(&(source, group))
            .cloned()
        else {
            return Ok(());
        };
        let (iif, oiflist, disable_wrongvif, rp) = self.resolve_form(&storage.form)?;
        self.mrouter
            .add_mfc(source, group, iif, oiflist, disable_wrongvif, rp)
    }

    /// Delete the module's proposal. When it was the installed one, the
    /// next-lowest dormant proposal is promoted into the kernel with no
    /// externally visible gap.
    pub fn delete_mfc(
        &mut self,
        module_instance_name: &str,
        source: IpAddr,
        group: IpAddr,
    ) -> Result<()> {
        let installed = (0..MAX_DISTANCE)
            .find(|&d| self.routes[d as usize].contains_key(&(source, group)));
        let owned = (0..MAX_DISTANCE).find(|&d| {
            self.routes[d as usize]
                .get(&(source, group))
                .map(|s| s.module_instance_name == module_instance_name)
                .unwrap_or(false)
        });
        let Some(distance) = owned else {
            return Err(CoreError::config(format!(
                "no mfc ({}, {}) owned by {}",
                source, group, module_instance_name
            )));
        };
        self.routes[distance as usize].remove(&(source, group));

        if installed != Some(distance) {
            // A dormant proposal went away; the kernel is untouched.
            return Ok(());
        }
        self.mrouter.delete_mfc(source, group)?;
        self.dft.delete_entry(source, group);

        // Promote the next proposal, if any.
        for next in 0..MAX_DISTANCE {
            if self.routes[next as usize].contains_key(&(source, group)) {
                return self.install_mfc(source, group, next);
            }
        }
        Ok(())
    }

    /// -- signal demultiplexing -------------------------------------------

    pub fn kernel_upcall(&mut self, databuf: &[u8]) {
        match self.mrouter.kernel_call_process(databuf) {
            Ok(signal) => self.signal_message_recv(signal),
            Err(err) => warn!("kernel upcall: {}", err),
        }
    }

    /// Forward a kernel signal to every registered protocol instance.
    pub fn signal_message_recv(&mut self, signal: KernelSignal) {
        if !self.running {
            return;
        }
        match signal.message_type {
            KernelSignalType::BwUpcall => {
                // Kernel-offloaded dataflow; nothing else sees it raw.
                self.kernel_bw_upcall(&signal);
                return;
            }
            KernelSignalType::NoCache | KernelSignalType::WrongVif | KernelSignalType::WholePkt => {
                let vif_up = self
                    .vif_by_index(signal.vif_index)
                    .map(|vif| vif.up)
                    .unwrap_or(false);
                if !vif_up {
                    // Silently ignore; the MIF is unknown or down.
                    return;
                }
                match (&signal.src, &signal.dst) {
                    (IpAddr::V4(src), IpAddr::V4(dst)) => {
                        if !is_routable_v4(src, dst) {
                            return;
                        }
                    }
                    (IpAddr::V6(src), IpAddr::V6(dst)) => {
                        if !is_routable_v6(src, dst) {
                            return;
                        }
                    }
                    _ => return,
                }
            }
        }

        // WRONGVIF suppression per installed MFC entry: if the signaling
        // MIF is in the entry's disable set, no module hears about it.
        if signal.message_type == KernelSignalType::WrongVif {
            let key = MfcKey {
                source: signal.src,
                group: signal.dst,
            };
            if let Some(entry) = self.mrouter.mfc_image().get(&key) {
                if entry.oiflist_disable_wrongvif.test(signal.vif_index) {
                    return;
                }
            }
        }

        for (name, module) in self.registered.iter() {
            let out = ProtocolSignal::Kernel {
                message_type: signal.message_type,
                vif_index: signal.vif_index,
                src: signal.src,
                dst: signal.dst,
                payload: signal.payload.clone(),
            };
            if module.tx.try_send(out).is_err() {
                warn!("signal to {} dropped (queue full)", name);
            }
        }
    }

    /// Kernel-offloaded dataflow results: the payload is a run of
    /// bw_upcall records, each reshaped into the common upcall form.
    fn kernel_bw_upcall(&mut self, signal: &KernelSignal) {
        use super::osdep::{BwUpcall, BW_UPCALL_GEQ, BW_UPCALL_UNIT_BYTES, BW_UPCALL_UNIT_PACKETS};
        let record = std::mem::size_of::<BwUpcall>();
        let mut rest = signal.payload.as_slice();
        while rest.len() >= record {
            let mut raw = BwUpcall::default();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    rest.as_ptr(),
                    &mut raw as *mut BwUpcall as *mut u8,
                    record,
                );
            }
            rest = &rest[record..];

            let source = IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(raw.bu_src)));
            let group = IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(raw.bu_dst)));
            let upcall = DataflowUpcall {
                source,
                group,
                threshold_interval: Duration::from_secs(raw.bu_threshold.b_time_sec as u64),
                measured_interval: Duration::from_secs(raw.bu_measured.b_time_sec as u64),
                threshold_packets: (raw.bu_flags & BW_UPCALL_UNIT_PACKETS != 0)
                    .then_some(raw.bu_threshold.b_packets as u32),
                threshold_bytes: (raw.bu_flags & BW_UPCALL_UNIT_BYTES != 0)
                    .then_some(raw.bu_threshold.b_bytes as u32),
                measured_packets: raw.bu_measured.b_packets,
                measured_bytes: raw.bu_measured.b_bytes,
                is_geq: raw.bu_flags & BW_UPCALL_GEQ != 0,
                module_instance_name: String::new(),
            };
            for module in self.registered.values() {
                let _ = module
                    .tx
                    .try_send(ProtocolSignal::Dataflow(upcall.clone()));
            }
        }
    }

    /// -- dataflow ---------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_dataflow_monitor(
        &mut self,
        module_instance_name: &str,
        source: IpAddr,
        group: IpAddr,
        threshold_interval: Duration,
        threshold_packets: Option<u32>,
        threshold_bytes: Option<u32>,
        is_geq: bool,
        is_leq: bool,
    ) -> Result<()> {
        if self.mrouter.caps().bw_upcall {
            // Kernel offload; still validated the same way.
            if is_geq == is_leq {
                return Err(CoreError::config(
                    "dataflow monitor needs exactly one of geq/leq",
                ));
            }
            return self.mrouter.add_bw_upcall(
                source,
                group,
                threshold_interval,
                threshold_packets,
                threshold_bytes,
                is_geq,
            );
        }
        let baseline = self.mrouter.get_sg_count(source, group).unwrap_or_default();
        self.dft.add_monitor(
            source,
            group,
            threshold_interval,
            threshold_packets,
            threshold_bytes,
            is_geq,
            is_leq,
            module_instance_name,
            self.tick_count,
            baseline,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn delete_dataflow_monitor(
        &mut self,
        module_instance_name: &str,
        source: IpAddr,
        group: IpAddr,
        threshold_interval: Duration,
        threshold_packets: Option<u32>,
        threshold_bytes: Option<u32>,
        is_geq: bool,
    ) -> Result<()> {
        if self.mrouter.caps().bw_upcall {
            return self.mrouter.delete_bw_upcall(
                source,
                group,
                threshold_interval,
                threshold_packets,
                threshold_bytes,
                is_geq,
            );
        }
        self.dft.delete_monitor(
            source,
            group,
            threshold_interval,
            threshold_packets,
            threshold_bytes,
            is_geq,
            module_instance_name,
        )
    }

    /// Userspace fallback poll: read (S,G) counters for every monitored
    /// flow and fire the thresholds that were crossed.
    pub fn dataflow_tick(&mut self) {
        self.tick_count += 1;
        if self.mrouter.caps().bw_upcall || self.dft.is_empty() {
            return;
        }
        let tick = self.tick_count;
        for (source, group) in self.dft.monitored_flows() {
            let Ok(counts) = self.mrouter.get_sg_count(source, group) else {
                continue;
            };
            self.deliver_dataflow(source, group, counts, tick);
        }
    }

    /// Split out so tests can inject counters without a kernel.
    pub fn deliver_dataflow(&mut self, source: IpAddr, group: IpAddr, counts: SgCount, tick: u64) {
        let upcalls = self.dft.poll(source, group, counts, tick);
        for upcall in upcalls {
            let Some(module) = self.registered.get(&upcall.module_instance_name) else {
                continue;
            };
            let _ = module.tx.try_send(ProtocolSignal::Dataflow(upcall));
        }
    }

    pub fn get_vif_count(&self, vifname: &str) -> Result<VifCount> {
        let vif = self
            .vifs
            .get(vifname)
            .ok_or_else(|| CoreError::config(format!("no such vif {}", vifname)))?;
        self.mrouter.get_vif_count(vif.vif_index)
    }

    /// -- event loop -------------------------------------------------------

    fn process_msg(&mut self, msg: Message) {
        let _guard = HandlerGuard::enter("mfea");
        match msg {
            Message::StartNode => {
                if let Err(err) = self.start_node() {
                    warn!("mfea start: {}", err);
                }
            }
            Message::StopNode => self.stop_node(),
            Message::IfEvent(event) => self.process_iftree_event(event),
            Message::RegisterProtocol {
                module_instance_name,
                ifname: _,
                vifname,
                ip_protocol,
                tx,
            } => {
                if let Err(err) =
                    self.register_protocol(&module_instance_name, &vifname, ip_protocol, tx)
                {
                    warn!("register {}: {}", module_instance_name, err);
                }
            }
            Message::UnregisterProtocol {
                module_instance_name,
                ifname: _,
                vifname,
            } => {
                if let Err(err) = self.unregister_protocol(&module_instance_name, &vifname) {
                    warn!("unregister {}: {}", module_instance_name, err);
                }
            }
            Message::EnableVif(name) => self.enable_vif(&name),
            Message::DisableVif(name) => self.disable_vif(&name),
            Message::StartVif(name) => {
                if let Err(err) = self.start_vif(&name) {
                    warn!("start vif {}: {}", name, err);
                }
            }
            Message::StopVif(name) => {
                if let Err(err) = self.stop_vif(&name) {
                    warn!("stop vif {}: {}", name, err);
                }
            }
            Message::AddMfc {
                module_instance_name,
                source,
                group,
                distance,
                form,
            } => {
                if let Err(err) = self.add_mfc(&module_instance_name, source, group, distance, form)
                {
                    warn!("add mfc ({}, {}): {}", source, group, err);
                }
            }
            Message::DeleteMfc {
                module_instance_name,
                source,
                group,
            } => {
                if let Err(err) = self.delete_mfc(&module_instance_name, source, group) {
                    warn!("delete mfc ({}, {}): {}", source, group, err);
                }
            }
            Message::AddDataflowMonitor {
                module_instance_name,
                source,
                group,
                threshold_interval,
                threshold_packets,
                threshold_bytes,
                is_geq,
                is_leq,
            } => {
                if let Err(err) = self.add_dataflow_monitor(
                    &module_instance_name,
                    source,
                    group,
                    threshold_interval,
                    threshold_packets,
                    threshold_bytes,
                    is_geq,
                    is_leq,
                ) {
                    warn!("add dataflow monitor: {}", err);
                }
            }
            Message::DeleteDataflowMonitor {
                module_instance_name,
                source,
                group,
                threshold_interval,
                threshold_packets,
                threshold_bytes,
                is_geq,
            } => {
                if let Err(err) = self.delete_dataflow_monitor(
                    &module_instance_name,
                    source,
                    group,
                    threshold_interval,
                    threshold_packets,
                    threshold_bytes,
                    is_geq,
                ) {
                    warn!("delete dataflow monitor: {}", err);
                }
            }
            Message::KernelUpcall(buf) => self.kernel_upcall(&buf),
            Message::DataflowTick => self.dataflow_tick(),
            Message::Show(tx) => {
                let out = self.show();
                tokio::spawn(async move {
                    let _ = tx.send(out).await;
                });
            }
        }
    }

    fn show(&self) -> String {
        use std::fmt::Write;
        let mut buf = String::new();
        writeln!(buf, "MFEA ({:?}) running: {}", self.family, self.running).unwrap();
        for vif in self.vifs.values() {
            writeln!(buf, "  {}", vif).unwrap();
        }
        for map in self.routes.iter() {
            for storage in map.values() {
                writeln!(
                    buf,
                    "  mfc ({}, {}) distance {} by {}",
                    storage.source, storage.group, storage.distance, storage.module_instance_name
                )
                .unwrap();
            }
        }
        buf
    }

    fn start_dataflow_clock(&mut self) {
        let tx = self.tx.clone();
        self.dataflow_timer = Some(Timer::repeat(1, move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Message::DataflowTick).await;
            }
        }));
    }

    pub async fn event_loop(&mut self) {
        self.start_dataflow_clock();
        info!("mfea ({:?}) started", self.family);
        while let Some(msg) = self.rx.recv().await {
            self.process_msg(msg);
        }
    }
}

fn is_routable_v4(src: &std::net::Ipv4Addr, dst: &std::net::Ipv4Addr) -> bool {
    use crate::bgp::route::{AddressFamily, Ipv4Af};
    Ipv4Af::is_unicast(src) && Ipv4Af::is_multicast(dst) && !Ipv4Af::is_linklocal_multicast(dst)
}

fn is_routable_v6(src: &std::net::Ipv6Addr, dst: &std::net::Ipv6Addr) -> bool {
    use crate::bgp::route::{AddressFamily, Ipv6Af};
    Ipv6Af::is_unicast(src) && Ipv6Af::is_multicast(dst) && !Ipv6Af::is_linklocal_multicast(dst)
}

pub fn serve(mut node: MfeaNode) {
    tokio::spawn(async move {
        node.event_loop().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::osdep::{IGMPMSG_SIZE, IGMPMSG_WRONGVIF};

    fn node() -> MfeaNode {
        // Detached mrouter: the user-space images are the observable
        // kernel state.
        let mut node = MfeaNode::new(Family::Ipv4, None);
        node.running = true;
        node
    }

    fn feed_eth0(node: &mut MfeaNode) {
        node.process_iftree_event(IfTreeEvent::InterfaceUpdate {
            ifname: "eth0".into(),
            ifindex: 2,
            enabled: true,
            mtu: 1500,
            op: UpdateOp::Created,
        });
        node.process_iftree_event(IfTreeEvent::VifUpdate {
            ifname: "eth0".into(),
            vifname: "eth0".into(),
            pif_index: 2,
            multicast: true,
            broadcast: true,
            p2p: false,
            loopback: false,
            up: true,
            op: UpdateOp::Created,
        });
        node.process_iftree_event(IfTreeEvent::Addr4Update {
            ifname: "eth0".into(),
            vifname: "eth0".into(),
            addr: "10.0.0.1".parse().unwrap(),
            prefix_len: 24,
            enabled: true,
            op: UpdateOp::Created,
        });
        node.process_iftree_event(IfTreeEvent::UpdatesCompleted);
    }

    fn binary_form(iif: u32, oifs: &[u32], disable_wrongvif: &[u32]) -> RouteForm {
        let mut oiflist = Mifset::new();
        for &i in oifs {
            oiflist.set(i);
        }
        let mut dis = Mifset::new();
        for &i in disable_wrongvif {
            dis.set(i);
        }
        RouteForm::Binary {
            iif_vif_index: iif,
            oiflist,
            oiflist_disable_wrongvif: dis,
            rp_addr: None,
        }
    }

    fn sg() -> (IpAddr, IpAddr) {
        ("192.0.2.1".parse().unwrap(), "239.1.1.1".parse().unwrap())
    }

    /// Distance priority: a lower-distance proposal displaces the
    /// installed entry, and deleting it promotes the dormant one back,
    /// with the kernel image never empty in between.
    #[test]
    fn mfc_distance_priority() {
        let mut node = node();
        let (s, g) = sg();
        let key = MfcKey { source: s, group: g };

        node.add_mfc("pim", s, g, 2, binary_form(0, &[1, 2], &[]))
            .unwrap();
        let entry = node.mrouter.mfc_image().get(&key).unwrap();
        assert!(entry.oiflist.test(1) && entry.oiflist.test(2));

        node.add_mfc("static", s, g, 0, binary_form(0, &[3], &[]))
            .unwrap();
        let entry = node.mrouter.mfc_image().get(&key).unwrap();
        assert!(entry.oiflist.test(3) && !entry.oiflist.test(1));

        // A dormant delete must not disturb the installed entry.
        node.add_mfc("igmp", s, g, 4, binary_form(0, &[5], &[])).unwrap();
        node.delete_mfc("igmp", s, g).unwrap();
        let entry = node.mrouter.mfc_image().get(&key).unwrap();
        assert!(entry.oiflist.test(3));

        // Deleting the installed proposal promotes pim's.
        node.delete_mfc("static", s, g).unwrap();
        let entry = node.mrouter.mfc_image().get(&key).unwrap();
        assert!(entry.oiflist.test(1) && entry.oiflist.test(2));

        node.delete_mfc("pim", s, g).unwrap();
        assert!(node.mrouter.mfc_image().get(&key).is_none());
        assert!(node.delete_mfc("pim", s, g).is_err());
    }

    /// Vif lifecycle: observe eth0 with its address, start it, and the
    /// kernel vif carries the observed primary address.
    #[test]
    fn vif_start_uses_observed_address() {
        let mut node = node();
        // A start request before the vif is observed defers.
        node.enable_vif("eth0");
        node.start_vif("eth0").unwrap();
        assert!(node.mrouter.vif_image().is_empty());

        feed_eth0(&mut node);
        let vif = node.vif_by_name("eth0").unwrap();
        assert!(vif.up, "deferred start fires once the vif appears");
        let image = node.mrouter.vif_image().get(&vif.vif_index).unwrap();
        assert_eq!(image.addr, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(image.pif_index, 2);
        assert!(!image.is_register);
    }

    /// WRONGVIF suppression: a signal on a MIF named in the entry's
    /// disable set reaches no registered module.
    #[tokio::test]
    async fn wrongvif_suppression() {
        let mut node = node();
        feed_eth0(&mut node);
        node.enable_vif("eth0");
        node.start_vif("eth0").unwrap();

        let (sig_tx, mut sig_rx) = mpsc::channel(16);
        node.register_protocol("pim", "eth0", 103, sig_tx).unwrap();

        let (s, g) = sg();
        let vif_index = node.vif_by_name("eth0").unwrap().vif_index;
        node.add_mfc("pim", s, g, 1, binary_form(0, &[vif_index], &[vif_index]))
            .unwrap();

        // Kernel delivers WRONGVIF on the suppressed MIF.
        let mut buf = vec![0u8; IGMPMSG_SIZE];
        buf[8] = IGMPMSG_WRONGVIF;
        buf[10] = vif_index as u8;
        buf[12..16].copy_from_slice(&[192, 0, 2, 1]);
        buf[16..20].copy_from_slice(&[239, 1, 1, 1]);
        node.kernel_upcall(&buf);
        assert!(sig_rx.try_recv().is_err(), "suppressed signal leaked");

        // The same signal for an unrelated group is delivered.
        buf[16..20].copy_from_slice(&[239, 9, 9, 9]);
        node.kernel_upcall(&buf);
        match sig_rx.try_recv().unwrap() {
            ProtocolSignal::Kernel { message_type, .. } => {
                assert_eq!(message_type, KernelSignalType::WrongVif);
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }

    /// Userspace bandwidth fallback: inject counters so that 1200
    /// packets are seen inside the 5 s window; exactly one upcall goes
    /// to the registering module.
    #[tokio::test]
    async fn dataflow_userspace_fallback() {
        let mut node = node();
        feed_eth0(&mut node);
        let (sig_tx, mut sig_rx) = mpsc::channel(16);
        node.register_protocol("pim", "eth0", 103, sig_tx).unwrap();

        let (s, g) = sg();
        assert!(!node.mrouter.caps().bw_upcall);
        node.add_dataflow_monitor(
            "pim",
            s,
            g,
            Duration::from_secs(5),
            Some(1000),
            None,
            true,
            false,
        )
        .unwrap();

        let counts = SgCount {
            pktcnt: 1200,
            bytecnt: 120_000,
            wrong_if: 0,
        };
        node.deliver_dataflow(s, g, counts, 5);

        let ProtocolSignal::Dataflow(upcall) = sig_rx.try_recv().unwrap() else {
            panic!("expected dataflow upcall");
        };
        assert_eq!(upcall.module_instance_name, "pim");
        assert_eq!(upcall.measured_packets, 1200);
        assert!(upcall.is_geq);
        assert!(sig_rx.try_recv().is_err(), "exactly one upcall expected");
    }

    /// Deleting a vif unregisters its protocol and removes the kernel
    /// MIF before the projection forgets it.
    #[test]
    fn vif_delete_ordering() {
        let mut node = node();
        feed_eth0(&mut node);
        node.enable_vif("eth0");
        node.start_vif("eth0").unwrap();
        let (sig_tx, _sig_rx) = mpsc::channel(4);
        node.register_protocol("pim", "eth0", 103, sig_tx).unwrap();

        node.process_iftree_event(IfTreeEvent::VifUpdate {
            ifname: "eth0".into(),
            vifname: "eth0".into(),
            pif_index: 2,
            multicast: true,
            broadcast: true,
            p2p: false,
            loopback: false,
            up: false,
            op: UpdateOp::Deleted,
        });
        assert!(node.vif_by_name("eth0").is_none());
        assert!(node.mrouter.vif_image().is_empty());
        assert!(node.iftree.vif("eth0", "eth0").is_none());
    }
}
