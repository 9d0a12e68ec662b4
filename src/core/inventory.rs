//! Host and virtual-machine inventory
//!
//! The reconciliation engine never talks to a virtualization platform
//! directly. It consumes the [`Inventory`] trait, which a platform client
//! (or the host-local [`HostInventory`]) implements.
//!
//! NIC descriptions use the platform's comma-separated `key=value` form:
//!
//! - qemu: `virtio=BC:24:11:AA:BB:CC,bridge=vmbr1,firewall=1`
//! - lxc:  `name=eth0,bridge=vmbr1,hwaddr=BC:24:11:AA:BB:CC,ip=10.0.0.5/24`

use crate::config::Config;
use crate::core::error::{Error, Result};
use crate::core::tool;
use crate::validators;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use tracing::{info, warn};

/// Guest type
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VmKind {
    Qemu,
    Lxc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub vmid: u32,
    pub name: String,
    pub status: String,
    pub kind: VmKind,
}

/// One guest network interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmNic {
    /// Config key, `net0`, `net1`, ...
    pub key: String,
    pub model: String,
    pub mac: String,
    pub bridge: String,
    /// Static addresses, possibly with a `/prefix` suffix
    pub ips: Vec<String>,
    pub lease_ip: Option<String>,
    pub lease_host: Option<String>,
}

/// A guest joined with its parsed NICs and matching leases
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmView {
    pub vmid: u32,
    pub name: String,
    pub kind: VmKind,
    pub status: String,
    pub nics: Vec<VmNic>,
}

/// A host network interface as reported by the inventory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNetwork {
    pub iface: String,
    /// `bridge`, `eth`, `bond`, `vlan`, ...
    pub kind: String,
    pub cidr: Option<String>,
    pub address: Option<String>,
    pub netmask: Option<String>,
    /// Space separated port list of a bridge
    pub bridge_ports: String,
}

impl HostNetwork {
    /// Configured CIDR, or one derived from address and netmask
    pub fn effective_cidr(&self) -> Option<String> {
        if let Some(cidr) = self.cidr.as_deref().filter(|c| !c.is_empty()) {
            return Some(cidr.to_string());
        }
        match (&self.address, &self.netmask) {
            (Some(address), Some(netmask)) => validators::cidr_from_addr_netmask(address, netmask).ok(),
            _ => None,
        }
    }

    pub fn is_bridge(&self) -> bool {
        self.kind == "bridge"
    }
}

/// A host bridge, annotated with whether natctl manages it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeView {
    pub name: String,
    pub cidr: Option<String>,
    pub ports: String,
    pub managed: bool,
}

/// An address-less physical, bond or VLAN interface usable as a bridge port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UplinkView {
    pub name: String,
    pub kind: String,
}

/// Source of VMs, host networks and bridge creation.
///
/// Implementations must be idempotent for [`Inventory::create_bridge`]:
/// creating a bridge that already exists with the same address succeeds.
pub trait Inventory: Send + Sync {
    fn list_vms(&self) -> impl Future<Output = Result<Vec<Vm>>> + Send;

    fn list_networks(&self) -> impl Future<Output = Result<Vec<HostNetwork>>> + Send;

    /// Raw guest configuration, key to value
    fn vm_config(&self, kind: VmKind, vmid: u32) -> impl Future<Output = Result<BTreeMap<String, String>>> + Send;

    /// Sets one `netN` entry of a guest configuration
    fn set_vm_net(&self, kind: VmKind, vmid: u32, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

    /// Creates a bridge with `cidr` (gateway/prefix) and optional uplink port
    fn create_bridge(&self, name: &str, cidr: &str, port: Option<&str>) -> impl Future<Output = Result<()>> + Send;
}

/// Matches `net0`, `net12`, ...
pub fn is_net_key(key: &str) -> bool {
    key.strip_prefix("net")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

fn split_kv(value: &str) -> Vec<&str> {
    value.split(',').map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn parse_kv(part: &str) -> Option<(&str, &str)> {
    match part.split_once('=') {
        Some((k, v)) if !k.is_empty() && !v.is_empty() => Some((k, v)),
        _ => None,
    }
}

fn kv_get<'a>(parts: &[&'a str], key: &str) -> Option<&'a str> {
    parts
        .iter()
        .filter_map(|p| parse_kv(p))
        .find_map(|(k, v)| (k == key).then_some(v))
}

/// Parses a qemu `netN` value (`model=MAC,bridge=...`).
///
/// A value stored without a MAC (`virtio,bridge=vmbr1`) keeps the model and
/// an empty MAC.
pub fn parse_qemu_nic(key: &str, value: &str) -> Option<VmNic> {
    if !is_net_key(key) {
        return None;
    }
    let parts = split_kv(value);
    let first = parts.first()?;
    let (model, mac) = parse_kv(first).unwrap_or((first, ""));
    Some(VmNic {
        key: key.to_string(),
        model: model.to_string(),
        mac: mac.to_string(),
        bridge: kv_get(&parts, "bridge").unwrap_or_default().to_string(),
        ..VmNic::default()
    })
}

/// Parses an lxc `netN` value (`name=eth0,bridge=...,hwaddr=...,ip=...`).
///
/// `ip=dhcp` is not a static address and is left out of `ips`.
pub fn parse_lxc_nic(key: &str, value: &str) -> Option<VmNic> {
    if !is_net_key(key) {
        return None;
    }
    let parts = split_kv(value);
    if parts.is_empty() {
        return None;
    }
    let ips = kv_get(&parts, "ip")
        .filter(|ip| *ip != "dhcp")
        .map(|ip| vec![ip.to_string()])
        .unwrap_or_default();
    Some(VmNic {
        key: key.to_string(),
        model: kv_get(&parts, "name").unwrap_or("lxc").to_string(),
        mac: kv_get(&parts, "hwaddr").unwrap_or_default().to_string(),
        bridge: kv_get(&parts, "bridge").unwrap_or_default().to_string(),
        ips,
        ..VmNic::default()
    })
}

/// Rewrites (or appends) the `bridge=` entry of a NIC value, keeping every
/// other entry in place.
pub fn update_bridge_in_net_string(value: &str, bridge: &str) -> String {
    let mut parts: Vec<String> = split_kv(value).into_iter().map(String::from).collect();
    if parts.is_empty() {
        return value.to_string();
    }
    let mut updated = false;
    for part in &mut parts {
        if parse_kv(part).is_some_and(|(k, _)| k == "bridge") {
            *part = format!("bridge={bridge}");
            updated = true;
        }
    }
    if !updated {
        parts.push(format!("bridge={bridge}"));
    }
    parts.join(",")
}

/// Bridges known to the inventory, sorted by name
pub fn bridge_views(networks: &[HostNetwork], config: &Config) -> Vec<BridgeView> {
    let mut views: Vec<BridgeView> = networks
        .iter()
        .filter(|n| n.is_bridge())
        .map(|n| BridgeView {
            name: n.iface.clone(),
            cidr: n.effective_cidr(),
            ports: n.bridge_ports.clone(),
            managed: config.find_bridge(&n.iface).is_some(),
        })
        .collect();
    views.sort_by(|a, b| a.name.cmp(&b.name));
    views
}

/// Address-less eth/bond/vlan interfaces, sorted by name
pub fn uplink_views(networks: &[HostNetwork]) -> Vec<UplinkView> {
    let mut uplinks: Vec<UplinkView> = networks
        .iter()
        .filter(|n| matches!(n.kind.as_str(), "eth" | "bond" | "vlan"))
        .filter(|n| n.cidr.is_none() && n.address.is_none())
        .map(|n| UplinkView {
            name: n.iface.clone(),
            kind: n.kind.clone(),
        })
        .collect();
    uplinks.sort_by(|a, b| a.name.cmp(&b.name));
    uplinks
}

/// Inventory of the local host: interfaces from sysfs and the kernel,
/// bridges created with `ip`. It knows no guests.
#[derive(Debug, Clone)]
pub struct HostInventory {
    ip: String,
    sys_class_net: PathBuf,
}

impl HostInventory {
    pub fn new(ip: impl Into<String>, sys_class_net: impl Into<PathBuf>) -> Self {
        Self {
            ip: ip.into(),
            sys_class_net: sys_class_net.into(),
        }
    }

    async fn classify(&self, name: &str) -> String {
        let base = self.sys_class_net.join(name);
        let exists = |sub: &'static str| {
            let path = base.join(sub);
            async move { tokio::fs::try_exists(path).await.unwrap_or(false) }
        };
        if exists("bridge").await {
            "bridge".to_string()
        } else if exists("bonding").await {
            "bond".to_string()
        } else if name.contains('.') {
            "vlan".to_string()
        } else if exists("device").await {
            "eth".to_string()
        } else {
            "virtual".to_string()
        }
    }

    async fn bridge_ports(&self, name: &str) -> String {
        let mut ports = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(self.sys_class_net.join(name).join("brif")).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(port) = entry.file_name().into_string() {
                    ports.push(port);
                }
            }
        }
        ports.sort();
        ports.join(" ")
    }

    async fn ip(&self, args: &[&str]) -> Result<()> {
        tool::run(&self.ip, args).await?.check().map(|_| ())
    }

    fn no_guests() -> Error {
        Error::Inventory("the local host inventory has no virtualization platform".to_string())
    }
}

impl Inventory for HostInventory {
    async fn list_vms(&self) -> Result<Vec<Vm>> {
        Ok(Vec::new())
    }

    async fn list_networks(&self) -> Result<Vec<HostNetwork>> {
        let mut addresses: HashMap<String, (String, Option<String>)> = HashMap::new();
        match NetworkInterface::show() {
            Ok(interfaces) => {
                for iface in interfaces {
                    for addr in &iface.addr {
                        if let Addr::V4(v4) = addr {
                            addresses
                                .entry(iface.name.clone())
                                .or_insert((v4.ip.to_string(), v4.netmask.map(|m| m.to_string())));
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to query interface addresses: {e}"),
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.sys_class_net)
            .await
            .map_err(|e| Error::Inventory(format!("read {}: {e}", self.sys_class_net.display())))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(name) = entry.file_name().into_string()
                && name != "lo"
            {
                names.push(name);
            }
        }
        names.sort();

        let mut networks = Vec::with_capacity(names.len());
        for name in names {
            let kind = self.classify(&name).await;
            let bridge_ports = if kind == "bridge" {
                self.bridge_ports(&name).await
            } else {
                String::new()
            };
            let (address, netmask) = match addresses.remove(&name) {
                Some((address, netmask)) => (Some(address), netmask),
                None => (None, None),
            };
            networks.push(HostNetwork {
                iface: name,
                kind,
                cidr: None,
                address,
                netmask,
                bridge_ports,
            });
        }
        Ok(networks)
    }

    async fn vm_config(&self, _kind: VmKind, _vmid: u32) -> Result<BTreeMap<String, String>> {
        Err(Self::no_guests())
    }

    async fn set_vm_net(&self, _kind: VmKind, _vmid: u32, _key: &str, _value: &str) -> Result<()> {
        Err(Self::no_guests())
    }

    async fn create_bridge(&self, name: &str, cidr: &str, port: Option<&str>) -> Result<()> {
        let exists = tool::run(&self.ip, &["link", "show", name]).await?.success;
        if exists {
            info!("Bridge {name} already exists");
        } else {
            self.ip(&["link", "add", name, "type", "bridge"]).await?;
            info!("Created bridge {name}");
        }

        self.ip(&["addr", "replace", cidr, "dev", name]).await?;
        if let Some(port) = port {
            self.ip(&["link", "set", port, "master", name]).await?;
            self.ip(&["link", "set", port, "up"]).await?;
        }
        self.ip(&["link", "set", name, "up"]).await?;

        info!("Bridge {name} up with {cidr}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{MockTools, test_config};
    use std::path::Path;

    #[test]
    fn test_is_net_key() {
        assert!(is_net_key("net0"));
        assert!(is_net_key("net12"));
        assert!(!is_net_key("net"));
        assert!(!is_net_key("netx"));
        assert!(!is_net_key("scsi0"));
    }

    #[test]
    fn test_parse_qemu_nic() {
        let nic = parse_qemu_nic("net0", "virtio=BC:24:11:AA:BB:CC,bridge=vmbr1,firewall=1").unwrap();
        assert_eq!(nic.model, "virtio");
        assert_eq!(nic.mac, "BC:24:11:AA:BB:CC");
        assert_eq!(nic.bridge, "vmbr1");
        assert!(nic.ips.is_empty());

        let bare = parse_qemu_nic("net1", "virtio,bridge=vmbr2").unwrap();
        assert_eq!(bare.model, "virtio");
        assert_eq!(bare.mac, "");
        assert_eq!(bare.bridge, "vmbr2");

        assert!(parse_qemu_nic("ide0", "virtio=AA,bridge=vmbr1").is_none());
        assert!(parse_qemu_nic("net0", "").is_none());
    }

    #[test]
    fn test_parse_lxc_nic() {
        let nic = parse_lxc_nic(
            "net0",
            "name=eth0,bridge=vmbr1,hwaddr=BC:24:11:00:00:01,ip=10.10.10.50/24,gw=10.10.10.1",
        )
        .unwrap();
        assert_eq!(nic.model, "eth0");
        assert_eq!(nic.mac, "BC:24:11:00:00:01");
        assert_eq!(nic.ips, vec!["10.10.10.50/24".to_string()]);

        let dhcp = parse_lxc_nic("net1", "bridge=vmbr1,ip=dhcp").unwrap();
        assert_eq!(dhcp.model, "lxc");
        assert!(dhcp.ips.is_empty());
    }

    #[test]
    fn test_update_bridge_in_net_string() {
        assert_eq!(
            update_bridge_in_net_string("virtio=BC:24:11:AA:BB:CC,bridge=vmbr0,firewall=1", "vmbr1"),
            "virtio=BC:24:11:AA:BB:CC,bridge=vmbr1,firewall=1"
        );
        assert_eq!(
            update_bridge_in_net_string("virtio=BC:24:11:AA:BB:CC", "vmbr1"),
            "virtio=BC:24:11:AA:BB:CC,bridge=vmbr1"
        );
        assert_eq!(update_bridge_in_net_string("", "vmbr1"), "");
    }

    #[test]
    fn test_effective_cidr() {
        let mut net = HostNetwork {
            iface: "vmbr1".into(),
            kind: "bridge".into(),
            address: Some("10.10.10.1".into()),
            netmask: Some("255.255.255.0".into()),
            ..HostNetwork::default()
        };
        assert_eq!(net.effective_cidr().as_deref(), Some("10.10.10.1/24"));
        net.cidr = Some("10.20.0.1/16".into());
        assert_eq!(net.effective_cidr().as_deref(), Some("10.20.0.1/16"));
        net.cidr = None;
        net.netmask = Some("255.0.255.0".into());
        assert_eq!(net.effective_cidr(), None);
    }

    #[test]
    fn test_bridge_and_uplink_views() {
        let mut config = test_config(Path::new("/x"));
        config
            .bridges
            .push(crate::core::model::Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1"));

        let networks = vec![
            HostNetwork {
                iface: "vmbr1".into(),
                kind: "bridge".into(),
                cidr: Some("10.10.10.1/24".into()),
                ..HostNetwork::default()
            },
            HostNetwork {
                iface: "vmbr0".into(),
                kind: "bridge".into(),
                bridge_ports: "eno1".into(),
                ..HostNetwork::default()
            },
            HostNetwork {
                iface: "eno2".into(),
                kind: "eth".into(),
                ..HostNetwork::default()
            },
            HostNetwork {
                iface: "eno1".into(),
                kind: "eth".into(),
                address: Some("192.168.1.2".into()),
                ..HostNetwork::default()
            },
        ];

        let bridges = bridge_views(&networks, &config);
        assert_eq!(bridges.len(), 2);
        assert_eq!(bridges[0].name, "vmbr0");
        assert!(!bridges[0].managed);
        assert!(bridges[1].managed);

        let uplinks = uplink_views(&networks);
        assert_eq!(
            uplinks,
            vec![UplinkView {
                name: "eno2".into(),
                kind: "eth".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_host_inventory_lists_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path().join("sys");
        std::fs::create_dir_all(sys.join("vmbr9/bridge")).unwrap();
        std::fs::create_dir_all(sys.join("vmbr9/brif/eno9")).unwrap();
        std::fs::create_dir_all(sys.join("eno9/device")).unwrap();
        std::fs::create_dir_all(sys.join("lo")).unwrap();

        let inventory = HostInventory::new("ip", &sys);
        let networks = inventory.list_networks().await.unwrap();
        let names: Vec<_> = networks.iter().map(|n| n.iface.as_str()).collect();
        assert_eq!(names, vec!["eno9", "vmbr9"]);
        assert_eq!(networks[0].kind, "eth");
        assert_eq!(networks[1].kind, "bridge");
        assert_eq!(networks[1].bridge_ports, "eno9");
        assert!(inventory.list_vms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_host_inventory_create_bridge_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTools::new(dir.path());
        mock.fail_ip_link_show();
        let inventory = HostInventory::new(mock.tools.ip.clone(), dir.path());

        inventory.create_bridge("vmbr5", "10.50.0.1/24", Some("eno2")).await.unwrap();

        assert_eq!(
            mock.ip_calls(),
            vec![
                "link show vmbr5",
                "link add vmbr5 type bridge",
                "addr replace 10.50.0.1/24 dev vmbr5",
                "link set eno2 master vmbr5",
                "link set eno2 up",
                "link set vmbr5 up",
            ]
        );
    }
}
