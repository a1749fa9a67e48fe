use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{CoreError, Result};

/// On-disk daemon configuration (YAML).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub bgp: BgpSection,
    #[serde(default)]
    pub mfea: MfeaSection,
    #[serde(default)]
    pub rib: RibSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgpSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "as", default)]
    pub asn: u32,
    pub router_id: Option<Ipv4Addr>,
    pub cluster_id: Option<Ipv4Addr>,
    #[serde(default)]
    pub always_compare_med: bool,
    #[serde(default)]
    pub confederation_id: Option<u32>,
    #[serde(default)]
    pub damping: Option<DampingSection>,
    #[serde(default)]
    pub peers: Vec<PeerSection>,
    #[serde(default)]
    pub aggregates: Vec<AggregateSection>,
    #[serde(default)]
    pub networks: Vec<NetworkSection>,
}

impl Default for BgpSection {
    fn default() -> Self {
        Self {
            enabled: false,
            asn: 0,
            router_id: None,
            cluster_id: None,
            always_compare_med: false,
            confederation_id: None,
            damping: None,
            peers: Vec::new(),
            aggregates: Vec::new(),
            networks: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DampingSection {
    #[serde(default)]
    pub enabled: bool,
    pub half_life: Option<u32>,
    pub max_hold_down: Option<u32>,
    pub reuse: Option<u32>,
    pub cutoff: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSection {
    pub address: IpAddr,
    pub peer_as: u32,
    #[serde(default)]
    pub passive: bool,
    pub hold_time: Option<u16>,
    pub connect_retry_time: Option<u16>,
    pub delay_open_time: Option<u16>,
    pub idle_hold_time: Option<u16>,
    pub prefix_limit: Option<u32>,
    #[serde(default)]
    pub reflector_client: bool,
    #[serde(default)]
    pub confederation_member: bool,
    pub md5_password: Option<String>,
    #[serde(default = "default_true")]
    pub four_octet_as: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateSection {
    pub prefix: IpNet,
    #[serde(default)]
    pub summary_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    pub prefix: IpNet,
    pub nexthop: IpAddr,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MfeaSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub enable_ipv6: bool,
    pub table_id: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RibSection {
    #[serde(default)]
    pub statics: Vec<StaticRouteSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticRouteSection {
    pub prefix: IpNet,
    #[serde(default)]
    pub metric: u32,
}

pub fn load(path: &Path) -> Result<DaemonConfig> {
    let text = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&text)
        .map_err(|e| CoreError::config(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
bgp:
  enabled: true
  as: 65000
  router_id: 10.0.0.100
  damping:
    enabled: true
    half_life: 15
  peers:
    - address: 10.0.0.1
      peer_as: 65001
    - address: 10.0.0.2
      peer_as: 65000
      reflector_client: true
mfea:
  enabled: true
rib:
  statics:
    - prefix: 10.0.0.0/8
      metric: 10
"#;
        let config: DaemonConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bgp.asn, 65000);
        assert_eq!(config.bgp.peers.len(), 2);
        assert!(config.bgp.peers[1].reflector_client);
        assert!(config.mfea.enabled);
        assert_eq!(config.rib.statics.len(), 1);
    }
}
