use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{CoreError, Result};

use super::mrouter::SgCount;

/// One bandwidth threshold on an (S,G). Several may coexist per flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataflowMonitor {
    pub threshold_interval: Duration,
    pub threshold_packets: Option<u32>,
    pub threshold_bytes: Option<u32>,
    /// true: fire when the measured delta is >= the threshold;
    /// false: fire when it is <=.
    pub is_geq: bool,
    pub module_instance_name: String,
    window_start_tick: u64,
    window_start_counts: SgCount,
}

/// A satisfied threshold, shaped like the kernel's bandwidth upcall so
/// both sources feed protocols identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataflowUpcall {
    pub source: IpAddr,
    pub group: IpAddr,
    pub threshold_interval: Duration,
    pub measured_interval: Duration,
    pub threshold_packets: Option<u32>,
    pub threshold_bytes: Option<u32>,
    pub measured_packets: u64,
    pub measured_bytes: u64,
    pub is_geq: bool,
    pub module_instance_name: String,
}

#[derive(Debug, Default)]
struct DataflowEntry {
    monitors: Vec<DataflowMonitor>,
}

/// The dataflow monitoring table. When the kernel grants BW_UPCALL the
/// filters live there; otherwise this table is polled with counter
/// snapshots and computes the same upcalls in user space.
#[derive(Debug, Default)]
pub struct MfeaDft {
    entries: BTreeMap<(IpAddr, IpAddr), DataflowEntry>,
}

impl MfeaDft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn monitored_flows(&self) -> Vec<(IpAddr, IpAddr)> {
        self.entries.keys().copied().collect()
    }

    pub fn monitor_count(&self, source: IpAddr, group: IpAddr) -> usize {
        self.entries
            .get(&(source, group))
            .map(|e| e.monitors.len())
            .unwrap_or(0)
    }

    /// Add a monitor. Validation: at least one of the packet/byte
    /// thresholds, and the comparison direction flags must name exactly
    /// one of GEQ and LEQ.
    #[allow(clippy::too_many_arguments)]
    pub fn add_monitor(
        &mut self,
        source: IpAddr,
        group: IpAddr,
        threshold_interval: Duration,
        threshold_packets: Option<u32>,
        threshold_bytes: Option<u32>,
        is_geq: bool,
        is_leq: bool,
        module_instance_name: &str,
        now_tick: u64,
        baseline: SgCount,
    ) -> Result<()> {
        if is_geq == is_leq {
            return Err(CoreError::config(
                "dataflow monitor needs exactly one of geq/leq",
            ));
        }
        if threshold_packets.is_none() && threshold_bytes.is_none() {
            return Err(CoreError::config(
                "dataflow monitor needs a packet or byte threshold",
            ));
        }
        if threshold_interval.is_zero() {
            return Err(CoreError::config("dataflow interval must be positive"));
        }
        let monitor = DataflowMonitor {
            threshold_interval,
            threshold_packets,
            threshold_bytes,
            is_geq,
            module_instance_name: module_instance_name.to_string(),
            window_start_tick: now_tick,
            window_start_counts: baseline,
        };
        let entry = self.entries.entry((source, group)).or_default();
        if entry
            .monitors
            .iter()
            .any(|m| same_monitor(m, &monitor))
        {
            return Err(CoreError::config("duplicate dataflow monitor"));
        }
        entry.monitors.push(monitor);
        Ok(())
    }

    /// Delete by exact spec; unknown monitors are a configuration error.
    #[allow(clippy::too_many_arguments)]
    pub fn delete_monitor(
        &mut self,
        source: IpAddr,
        group: IpAddr,
        threshold_interval: Duration,
        threshold_packets: Option<u32>,
        threshold_bytes: Option<u32>,
        is_geq: bool,
        module_instance_name: &str,
    ) -> Result<()> {
        let Some(entry) = self.entries.get_mut(&(source, group)) else {
            return Err(CoreError::config("no such dataflow entry"));
        };
        let before = entry.monitors.len();
        entry.monitors.retain(|m| {
            !(m.threshold_interval == threshold_interval
                && m.threshold_packets == threshold_packets
                && m.threshold_bytes == threshold_bytes
                && m.is_geq == is_geq
                && m.module_instance_name == module_instance_name)
        });
        if entry.monitors.len() == before {
            return Err(CoreError::config("no such dataflow monitor"));
        }
        if entry.monitors.is_empty() {
            self.entries.remove(&(source, group));
        }
        Ok(())
    }

    /// Remove every monitor for the (S,G); used when its MFC entry dies.
    pub fn delete_entry(&mut self, source: IpAddr, group: IpAddr) {
        self.entries.remove(&(source, group));
    }

    /// Userspace fallback: feed a counter snapshot for one flow. Each
    /// monitor whose interval has elapsed compares the delta against its
    /// threshold and fires at most one upcall, then starts a new window.
    pub fn poll(
        &mut self,
        source: IpAddr,
        group: IpAddr,
        counts: SgCount,
        now_tick: u64,
    ) -> Vec<DataflowUpcall> {
        let Some(entry) = self.entries.get_mut(&(source, group)) else {
            return Vec::new();
        };
        let mut upcalls = Vec::new();
        for monitor in entry.monitors.iter_mut() {
            let elapsed = now_tick.saturating_sub(monitor.window_start_tick);
            if elapsed < monitor.threshold_interval.as_secs() {
                continue;
            }
            let measured_packets = counts
                .pktcnt
                .saturating_sub(monitor.window_start_counts.pktcnt);
            let measured_bytes = counts
                .bytecnt
                .saturating_sub(monitor.window_start_counts.bytecnt);

            let crossed = {
                let pkt_hit = monitor
                    .threshold_packets
                    .map(|t| compare(monitor.is_geq, measured_packets, t as u64));
                let byte_hit = monitor
                    .threshold_bytes
                    .map(|t| compare(monitor.is_geq, measured_bytes, t as u64));
                pkt_hit.unwrap_or(false) || byte_hit.unwrap_or(false)
            };
            if crossed {
                upcalls.push(DataflowUpcall {
                    source,
                    group,
                    threshold_interval: monitor.threshold_interval,
                    measured_interval: Duration::from_secs(elapsed),
                    threshold_packets: monitor.threshold_packets,
                    threshold_bytes: monitor.threshold_bytes,
                    measured_packets,
                    measured_bytes,
                    is_geq: monitor.is_geq,
                    module_instance_name: monitor.module_instance_name.clone(),
                });
            }
            // A new measurement window starts either way.
            monitor.window_start_tick = now_tick;
            monitor.window_start_counts = counts;
        }
        upcalls
    }
}

fn compare(is_geq: bool, measured: u64, threshold: u64) -> bool {
    if is_geq {
        measured >= threshold
    } else {
        measured <= threshold
    }
}

fn same_monitor(a: &DataflowMonitor, b: &DataflowMonitor) -> bool {
    a.threshold_interval == b.threshold_interval
        && a.threshold_packets == b.threshold_packets
        && a.threshold_bytes == b.threshold_bytes
        && a.is_geq == b.is_geq
        && a.module_instance_name == b.module_instance_name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> (IpAddr, IpAddr) {
        ("192.0.2.1".parse().unwrap(), "239.1.1.1".parse().unwrap())
    }

    fn counts(pkts: u64, bytes: u64) -> SgCount {
        SgCount {
            pktcnt: pkts,
            bytecnt: bytes,
            wrong_if: 0,
        }
    }

    #[test]
    fn validation() {
        let (s, g) = flow();
        let mut dft = MfeaDft::new();
        // Both geq and leq.
        assert!(dft
            .add_monitor(s, g, Duration::from_secs(5), Some(1000), None, true, true, "pim", 0, counts(0, 0))
            .is_err());
        // No thresholds.
        assert!(dft
            .add_monitor(s, g, Duration::from_secs(5), None, None, true, false, "pim", 0, counts(0, 0))
            .is_err());
        assert!(dft
            .add_monitor(s, g, Duration::from_secs(5), Some(1000), None, true, false, "pim", 0, counts(0, 0))
            .is_ok());
        assert_eq!(dft.monitor_count(s, g), 1);
    }

    /// Userspace fallback: 1200 packets inside a 5 s GEQ window emit
    /// exactly one upcall for the registered module.
    #[test]
    fn geq_window_fires_once() {
        let (s, g) = flow();
        let mut dft = MfeaDft::new();
        dft.add_monitor(s, g, Duration::from_secs(5), Some(1000), None, true, false, "pim", 0, counts(0, 0))
            .unwrap();

        // Mid-window polls stay silent.
        assert!(dft.poll(s, g, counts(600, 60_000), 3).is_empty());
        // Window complete: 1200 packets seen.
        let upcalls = dft.poll(s, g, counts(1200, 120_000), 5);
        assert_eq!(upcalls.len(), 1);
        assert_eq!(upcalls[0].module_instance_name, "pim");
        assert_eq!(upcalls[0].measured_packets, 1200);

        // The next window measures fresh deltas; no immediate re-fire.
        assert!(dft.poll(s, g, counts(1300, 130_000), 10).is_empty());
    }

    #[test]
    fn delete_by_exact_spec() {
        let (s, g) = flow();
        let mut dft = MfeaDft::new();
        dft.add_monitor(s, g, Duration::from_secs(5), Some(1000), None, true, false, "pim", 0, counts(0, 0))
            .unwrap();
        assert!(dft
            .delete_monitor(s, g, Duration::from_secs(5), Some(999), None, true, "pim")
            .is_err());
        assert!(dft
            .delete_monitor(s, g, Duration::from_secs(5), Some(1000), None, true, "pim")
            .is_ok());
        assert!(dft.is_empty());
    }
}
