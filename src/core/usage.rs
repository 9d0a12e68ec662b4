//! Advisory view of addresses already taken inside managed bridges
//!
//! Nothing here reserves an address; it only helps the operator pick a free
//! one for a new forward or static guest. Sources are the bridge gateway,
//! enabled forward targets, DHCP leases and guest NIC addresses.

use crate::core::inventory::{Inventory, Vm, VmKind, VmView, parse_lxc_nic, parse_qemu_nic};
use crate::core::model::{Bridge, Lease};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use tracing::warn;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UsageSource {
    Gateway,
    Forward,
    Dhcp,
    Vm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsedIp {
    pub ip: Ipv4Addr,
    pub source: UsageSource,
    pub vmid: Option<u32>,
    pub vm_name: Option<String>,
    pub mac: Option<String>,
}

impl UsedIp {
    fn plain(ip: Ipv4Addr, source: UsageSource) -> Self {
        Self {
            ip,
            source,
            vmid: None,
            vm_name: None,
            mac: None,
        }
    }
}

impl std::fmt::Display for UsedIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<16} {}", self.ip, self.source)?;
        if let Some(vmid) = self.vmid {
            write!(f, " {vmid}")?;
        }
        if let Some(name) = &self.vm_name {
            write!(f, " {name}")?;
        }
        if let Some(mac) = &self.mac {
            write!(f, " {mac}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeUsage {
    pub bridge: String,
    pub subnet: String,
    pub ips: Vec<UsedIp>,
}

/// A candidate forward target seen on a guest NIC
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeIpOption {
    pub ip: Ipv4Addr,
    /// `"<vmid> <name> (<netN>)"`
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeIpList {
    pub bridge: String,
    pub options: Vec<BridgeIpOption>,
}

/// Parses a NIC address, dropping any `/prefix`
fn host_address(text: &str) -> Option<Ipv4Addr> {
    text.trim().split('/').next()?.parse().ok()
}

fn normalize_mac(mac: &str) -> String {
    mac.trim().to_lowercase()
}

/// Per managed bridge, every known address inside its subnet.
///
/// Entries are deduplicated on (source, address) and sorted numerically;
/// bridges are sorted by name.
pub fn used_ips(bridges: &[Bridge], leases: &[Lease], vms: &[VmView]) -> Vec<BridgeUsage> {
    let mut out: Vec<BridgeUsage> = bridges
        .iter()
        .map(|bridge| {
            let mut ips = Vec::new();

            if let Some(gw) = host_address(&bridge.gateway_ip) {
                ips.push(UsedIp::plain(gw, UsageSource::Gateway));
            }
            for forward in bridge.enabled_forwards() {
                if let Some(ip) = host_address(&forward.int_ip) {
                    ips.push(UsedIp::plain(ip, UsageSource::Forward));
                }
            }

            if let Some(net) = bridge.network() {
                for lease in leases {
                    if let Some(ip) = host_address(&lease.ip)
                        && net.contains(ip)
                    {
                        ips.push(UsedIp {
                            mac: Some(lease.mac.clone()),
                            ..UsedIp::plain(ip, UsageSource::Dhcp)
                        });
                    }
                }
                for vm in vms {
                    for nic in &vm.nics {
                        for ip in nic.ips.iter().filter_map(|ip| host_address(ip)) {
                            if net.contains(ip) {
                                ips.push(UsedIp {
                                    ip,
                                    source: UsageSource::Vm,
                                    vmid: Some(vm.vmid),
                                    vm_name: Some(vm.name.clone()),
                                    mac: Some(nic.mac.clone()).filter(|m| !m.is_empty()),
                                });
                            }
                        }
                    }
                }
            }

            let mut seen = HashSet::new();
            ips.retain(|u| seen.insert((u.source, u.ip)));
            ips.sort_by_key(|u| (u32::from(u.ip), u.source));

            BridgeUsage {
                bridge: bridge.name.clone(),
                subnet: bridge.subnet.clone(),
                ips,
            }
        })
        .collect();

    out.sort_by(|a, b| a.bridge.cmp(&b.bridge));
    out
}

/// Per managed bridge, the guest addresses seen on NICs attached to it.
///
/// The lease address of a NIC comes before its static addresses; each
/// address appears once per bridge. Bridges with no candidates are omitted.
pub fn bridge_ip_options(bridges: &[Bridge], vms: &[VmView]) -> Vec<BridgeIpList> {
    let managed: HashSet<&str> = bridges.iter().map(|b| b.name.as_str()).collect();
    let mut seen = HashSet::new();
    let mut by_bridge: HashMap<String, Vec<BridgeIpOption>> = HashMap::new();

    for vm in vms {
        for nic in &vm.nics {
            if nic.bridge.is_empty() || !managed.contains(nic.bridge.as_str()) {
                continue;
            }
            let candidates = nic.lease_ip.iter().chain(nic.ips.iter());
            for ip in candidates.filter_map(|ip| host_address(ip)) {
                if !seen.insert((nic.bridge.clone(), ip)) {
                    continue;
                }
                by_bridge.entry(nic.bridge.clone()).or_default().push(BridgeIpOption {
                    ip,
                    label: format!("{} {} ({})", vm.vmid, vm.name, nic.key),
                });
            }
        }
    }

    let mut out: Vec<BridgeIpList> = by_bridge
        .into_iter()
        .map(|(bridge, mut options)| {
            options.sort_by_key(|o| u32::from(o.ip));
            BridgeIpList { bridge, options }
        })
        .collect();
    out.sort_by(|a, b| a.bridge.cmp(&b.bridge));
    out
}

/// Joins each guest's NICs with DHCP leases by MAC.
///
/// A guest whose configuration cannot be fetched is still listed, without
/// NICs. A NIC without static addresses adopts its lease address.
pub async fn build_vm_views<I: Inventory>(inventory: &I, vms: &[Vm], leases: &[Lease]) -> Vec<VmView> {
    let lease_by_mac: HashMap<String, &Lease> = leases
        .iter()
        .filter(|l| !l.mac.trim().is_empty())
        .map(|l| (normalize_mac(&l.mac), l))
        .collect();

    let mut views = Vec::with_capacity(vms.len());
    for vm in vms {
        let config = match inventory.vm_config(vm.kind, vm.vmid).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to get config of {} {}: {e}", vm.kind, vm.vmid);
                Default::default()
            }
        };

        // BTreeMap iteration keeps NICs ordered by key
        let mut nics: Vec<_> = config
            .iter()
            .filter_map(|(key, value)| match vm.kind {
                VmKind::Qemu => parse_qemu_nic(key, value),
                VmKind::Lxc => parse_lxc_nic(key, value),
            })
            .collect();

        for nic in &mut nics {
            if nic.mac.is_empty() {
                continue;
            }
            if let Some(lease) = lease_by_mac.get(&normalize_mac(&nic.mac)) {
                nic.lease_ip = Some(lease.ip.clone());
                nic.lease_host = Some(lease.hostname.clone());
                if nic.ips.is_empty() && !lease.ip.is_empty() {
                    nic.ips.push(lease.ip.clone());
                }
            }
        }

        views.push(VmView {
            vmid: vm.vmid,
            name: vm.name.clone(),
            kind: vm.kind,
            status: vm.status.clone(),
            nics,
        });
    }

    views.sort_by_key(|v| v.vmid);
    views
}
