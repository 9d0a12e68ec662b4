//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.
//!
//! Host tools are replaced by small shell scripts written into each test's
//! temporary directory, so tests never touch real nftables, systemd or
//! links, and never share state through environment variables.

use crate::config::{Config, HostPaths};
use crate::core::error::{Error, Result};
use crate::core::inventory::{HostNetwork, Inventory, Vm, VmKind};
use crate::core::model::{Bridge, PortForward, Protocol};
use crate::core::tool::Tools;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Writes an executable `/bin/sh` script and returns its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> String {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

/// Mock `nft`, `systemctl` and `ip` living in `<dir>/mock`.
///
/// Each script appends its arguments to `<tool>.log`. For `nft` and
/// `systemctl`, writing `<tool>.fail` makes every later call print the file
/// and exit 1.
///
/// - `nft -f FILE` copies FILE to `nft.loaded`; `delete` and `list` fail
///   with the kernel's "No such file or directory" when nothing is loaded
/// - `systemctl restart|start|stop` maintain an `active` marker that
///   `is-active` reports on
/// - `ip link show` fails with "does not exist" after
///   [`MockTools::fail_ip_link_show`]
pub struct MockTools {
    pub tools: Tools,
    dir: PathBuf,
}

impl MockTools {
    pub fn new(root: &Path) -> Self {
        let dir = root.join("mock");
        let d = dir.display();

        let nft = write_script(
            &dir,
            "nft",
            &format!(
                r#"echo "$*" >> '{d}/nft.log'
if [ -f '{d}/nft.fail' ]; then cat '{d}/nft.fail' >&2; exit 1; fi
case "$1" in
  -f) cp "$2" '{d}/nft.loaded' ;;
  delete)
    if [ -f '{d}/nft.loaded' ]; then rm -f '{d}/nft.loaded'
    else echo "Error: Could not process rule: No such file or directory" >&2; exit 1; fi ;;
  list)
    if [ -f '{d}/nft.loaded' ]; then cat '{d}/nft.loaded'
    else echo "Error: No such file or directory" >&2; exit 1; fi ;;
esac
"#
            ),
        );

        let systemctl = write_script(
            &dir,
            "systemctl",
            &format!(
                r#"echo "$*" >> '{d}/systemctl.log'
if [ -f '{d}/systemctl.fail' ]; then cat '{d}/systemctl.fail' >&2; exit 1; fi
case "$1" in
  restart|start) touch '{d}/systemctl.active' ;;
  stop) rm -f '{d}/systemctl.active' ;;
  is-active)
    if [ -f '{d}/systemctl.active' ]; then echo active
    else echo inactive; exit 3; fi ;;
esac
"#
            ),
        );

        let ip = write_script(
            &dir,
            "ip",
            &format!(
                r#"echo "$*" >> '{d}/ip.log'
if [ "$1" = link ] && [ "$2" = show ] && [ -f '{d}/ip.noexist' ]; then
  echo "Device \"$3\" does not exist." >&2; exit 1
fi
"#
            ),
        );

        Self {
            tools: Tools { nft, systemctl, ip },
            dir,
        }
    }

    pub fn fail_nft(&self, message: &str) {
        std::fs::write(self.dir.join("nft.fail"), message).unwrap();
    }

    pub fn clear_nft_failure(&self) {
        std::fs::remove_file(self.dir.join("nft.fail")).unwrap();
    }

    pub fn fail_systemctl(&self, message: &str) {
        std::fs::write(self.dir.join("systemctl.fail"), message).unwrap();
    }

    /// Makes `ip link show` report every link as missing
    pub fn fail_ip_link_show(&self) {
        std::fs::write(self.dir.join("ip.noexist"), "").unwrap();
    }

    /// Ruleset currently "loaded" into the mock kernel
    pub fn loaded_rules(&self) -> Option<String> {
        std::fs::read_to_string(self.dir.join("nft.loaded")).ok()
    }

    pub fn nft_calls(&self) -> Vec<String> {
        self.calls("nft.log")
    }

    pub fn systemctl_calls(&self) -> Vec<String> {
        self.calls("systemctl.log")
    }

    pub fn ip_calls(&self) -> Vec<String> {
        self.calls("ip.log")
    }

    fn calls(&self, log: &str) -> Vec<String> {
        std::fs::read_to_string(self.dir.join(log))
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

pub fn test_paths(root: &Path) -> HostPaths {
    HostPaths::under(root)
}

/// Minimal valid model: PAM auth, WAN `vmbr0`, no bridges
pub fn test_config(path: &Path) -> Config {
    let mut config = Config::default();
    config.session_secret = "0".repeat(64);
    config.wan_interface = "vmbr0".to_string();
    config.set_path(path);
    config.apply_defaults();
    config
}

/// Enabled forward with a fresh id and no comment
pub fn forward(protocol: Protocol, ext_port: u16, int_ip: &str, int_port: u16) -> PortForward {
    PortForward {
        id: PortForward::new_id(),
        protocol,
        ext_port,
        int_ip: int_ip.to_string(),
        int_port,
        comment: String::new(),
        enabled: true,
    }
}

/// Bridge without NAT carrying one enabled forward, tcp 2222 to `.10:22`
pub fn bridge_with_forward(name: &str, subnet: &str, gateway: &str) -> Bridge {
    let network: ipnetwork::Ipv4Network = subnet.parse().unwrap();
    let target = std::net::Ipv4Addr::from(u32::from(network.network()) + 10);

    let mut bridge = Bridge::new(name, subnet, gateway);
    bridge
        .forwards
        .push(forward(Protocol::Tcp, 2222, &target.to_string(), 22));
    bridge
}

pub fn host_bridge(name: &str, cidr: &str) -> HostNetwork {
    HostNetwork {
        iface: name.to_string(),
        kind: "bridge".to_string(),
        cidr: Some(cidr.to_string()),
        ..HostNetwork::default()
    }
}

pub fn host_uplink(name: &str) -> HostNetwork {
    HostNetwork {
        iface: name.to_string(),
        kind: "eth".to_string(),
        ..HostNetwork::default()
    }
}

/// In-memory inventory that records the changes asked of it
#[derive(Debug, Default)]
pub struct StaticInventory {
    pub vms: Vec<Vm>,
    pub configs: BTreeMap<u32, BTreeMap<String, String>>,
    pub networks: Vec<HostNetwork>,
    pub fail_create: bool,
    pub created: Mutex<Vec<(String, String, Option<String>)>>,
    pub net_updates: Mutex<Vec<(u32, String, String)>>,
}

impl StaticInventory {
    pub fn created(&self) -> Vec<(String, String, Option<String>)> {
        self.created.lock().unwrap().clone()
    }

    pub fn net_updates(&self) -> Vec<(u32, String, String)> {
        self.net_updates.lock().unwrap().clone()
    }
}

impl Inventory for StaticInventory {
    async fn list_vms(&self) -> Result<Vec<Vm>> {
        Ok(self.vms.clone())
    }

    async fn list_networks(&self) -> Result<Vec<HostNetwork>> {
        Ok(self.networks.clone())
    }

    async fn vm_config(&self, _kind: VmKind, vmid: u32) -> Result<BTreeMap<String, String>> {
        self.configs
            .get(&vmid)
            .cloned()
            .ok_or_else(|| Error::Inventory(format!("no config for guest {vmid}")))
    }

    async fn set_vm_net(&self, _kind: VmKind, vmid: u32, key: &str, value: &str) -> Result<()> {
        self.net_updates
            .lock()
            .unwrap()
            .push((vmid, key.to_string(), value.to_string()));
        Ok(())
    }

    async fn create_bridge(&self, name: &str, cidr: &str, port: Option<&str>) -> Result<()> {
        if self.fail_create {
            return Err(Error::Inventory(format!("cannot create {name}")));
        }
        self.created
            .lock()
            .unwrap()
            .push((name.to_string(), cidr.to_string(), port.map(str::to_string)));
        Ok(())
    }
}
