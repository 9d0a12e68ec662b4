//! Serialized mutate, persist, reconcile
//!
//! [`NetworkState`] owns the in-memory model behind one async lock. A
//! mutation holds the lock from validation through the last reconciler, so
//! two operations never interleave their writes to the model file or to the
//! host.
//!
//! Mutations are applied to a copy of the model. The copy replaces the live
//! model only after it has been written to disk, which makes a persist
//! failure a clean rollback: memory, file and host all keep the previous
//! declaration. Reconciler failures come after the commit point and are
//! reported in the [`ApplyReport`] instead.

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::config::{Config, HostPaths, InitOptions};
use crate::core::dhcp::{self, DhcpPlan, DhcpReconciler};
use crate::core::error::{Error, Result, ValidationError};
use crate::core::inventory::{self, BridgeView, Inventory, UplinkView, VmKind};
use crate::core::model::{Bridge, DhcpPool, Lease, PortForward, Protocol};
use crate::core::nat::{self, NatPlan, NatReconciler};
use crate::core::report::{ApplyReport, StepOutcome};
use crate::core::tool::Tools;
use crate::core::usage::{self, BridgeIpList, BridgeUsage};
use crate::validators;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// A port forward as requested by the operator
#[derive(Debug, Clone)]
pub struct NewForward {
    pub bridge: String,
    pub protocol: Protocol,
    pub ext_port: u16,
    pub int_ip: String,
    pub int_port: u16,
    pub comment: String,
}

/// A bridge to create on the host and then manage
#[derive(Debug, Clone)]
pub struct NewBridge {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
    pub nat_enabled: bool,
    /// Address-less interface to enslave as the bridge port
    pub uplink: Option<String>,
    pub dhcp: Option<DhcpPool>,
}

/// An existing host bridge to bring under management
#[derive(Debug, Clone)]
pub struct AttachBridge {
    pub name: String,
    pub nat_enabled: bool,
    pub dhcp: Option<DhcpPool>,
}

/// Live state of the host next to the model
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub wan_interface: String,
    pub bridges: usize,
    pub forwards: usize,
    pub nat_rules: String,
    pub dhcp_active: bool,
}

struct Reconciled {
    report: ApplyReport,
    nat_digest: Option<String>,
    dhcp_digest: Option<String>,
}

/// The model plus the reconcilers that project it onto the host
pub struct NetworkState {
    config: Mutex<Config>,
    nat: NatReconciler,
    dhcp: DhcpReconciler,
    audit: AuditLog,
}

impl NetworkState {
    pub fn new(config: Config, tools: &Tools, paths: &HostPaths) -> Self {
        Self {
            config: Mutex::new(config),
            nat: NatReconciler::new(tools, paths),
            dhcp: DhcpReconciler::new(tools, paths),
            audit: AuditLog::new(&paths.audit_log),
        }
    }

    /// Loads the model file named by `paths`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the model file is missing or invalid.
    pub async fn load(tools: &Tools, paths: &HostPaths) -> Result<Self> {
        let config = Config::load(&paths.config_file).await?;
        Ok(Self::new(config, tools, paths))
    }

    /// Writes a fresh model file and records the outcome in the audit log.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the model file already exists, the settings are
    /// invalid, or the file cannot be written.
    pub async fn init(options: InitOptions, tools: &Tools, paths: &HostPaths) -> Result<Self> {
        let audit = AuditLog::new(&paths.audit_log);
        let details = json!({
            "path": paths.config_file,
            "wan_interface": options.wan_interface.trim(),
        });

        match Config::init(&paths.config_file, options).await {
            Ok(config) => {
                audit
                    .record(AuditEvent::new(EventType::InitConfig, true, details, None))
                    .await;
                Ok(Self::new(config, tools, paths))
            }
            Err(e) => {
                audit
                    .record(AuditEvent::new(
                        EventType::InitConfig,
                        false,
                        details,
                        Some(e.to_string()),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    pub fn nat(&self) -> &NatReconciler {
        &self.nat
    }

    pub fn dhcp(&self) -> &DhcpReconciler {
        &self.dhcp
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Copy of the current model
    pub async fn snapshot(&self) -> Config {
        self.config.lock().await.clone()
    }

    pub async fn bridges(&self) -> Vec<Bridge> {
        self.config.lock().await.bridges.clone()
    }

    /// Flips NAT on a managed bridge. Returns the new setting.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the bridge is not managed or the model cannot be saved.
    pub async fn toggle_nat(&self, bridge: &str) -> Result<(bool, ApplyReport)> {
        let name = bridge.to_string();
        let (enabled, report) = self
            .commit(EventType::ToggleNat, json!({ "bridge": bridge }), |config| {
                let bridge = config
                    .find_bridge_mut(&name)
                    .ok_or_else(|| ValidationError::UnknownBridge(name.clone()))?;
                bridge.nat_enabled = !bridge.nat_enabled;
                Ok(bridge.nat_enabled)
            })
            .await?;
        info!("NAT on {bridge} {}", if enabled { "enabled" } else { "disabled" });
        Ok((enabled, report))
    }

    /// Adds an enabled forward. Returns its generated id.
    ///
    /// # Errors
    ///
    /// Returns `Err` for invalid ports or addresses, an unknown bridge, a
    /// target outside the bridge subnet, an external port already taken on
    /// an overlapping transport, or a failed save.
    pub async fn add_forward(&self, request: NewForward) -> Result<(String, ApplyReport)> {
        validators::validate_port("ext_port", request.ext_port)?;
        validators::validate_port("int_port", request.int_port)?;
        let int_ip = validators::parse_ipv4(&request.int_ip)?;

        let forward = PortForward {
            id: PortForward::new_id(),
            protocol: request.protocol,
            ext_port: request.ext_port,
            int_ip: int_ip.to_string(),
            int_port: request.int_port,
            comment: validators::sanitize_comment(&request.comment),
            enabled: true,
        };
        let id = forward.id.clone();
        let details = json!({
            "id": id,
            "bridge": request.bridge,
            "protocol": forward.protocol,
            "ext_port": forward.ext_port,
            "target": format!("{}:{}", forward.int_ip, forward.int_port),
        });

        let ((), report) = self
            .commit(EventType::AddForward, details, |config| {
                config.check_port_conflict(forward.ext_port, forward.protocol, None)?;
                let bridge = config
                    .find_bridge_mut(&request.bridge)
                    .ok_or_else(|| ValidationError::UnknownBridge(request.bridge.clone()))?;
                if !bridge.contains(int_ip) {
                    return Err(ValidationError::AddressOutsideSubnet {
                        address: int_ip.to_string(),
                        subnet: bridge.subnet.clone(),
                    }
                    .into());
                }
                bridge.forwards.push(forward);
                Ok(())
            })
            .await?;
        info!("Added forward {id}");
        Ok((id, report))
    }

    /// # Errors
    ///
    /// Returns `Err` if no forward has this id or the model cannot be saved.
    pub async fn delete_forward(&self, id: &str) -> Result<ApplyReport> {
        let ((), report) = self
            .commit(EventType::DeleteForward, json!({ "id": id }), |config| {
                if config.delete_forward(id) {
                    Ok(())
                } else {
                    Err(ValidationError::UnknownForward(id.to_string()).into())
                }
            })
            .await?;
        info!("Deleted forward {id}");
        Ok(report)
    }

    /// Enables or disables a forward. Re-enabling is refused if another
    /// enabled forward took the external port in the meantime.
    ///
    /// # Errors
    ///
    /// Returns `Err` on an unknown id, a port conflict, or a failed save.
    pub async fn toggle_forward(&self, id: &str) -> Result<(bool, ApplyReport)> {
        let (enabled, report) = self
            .commit(EventType::ToggleForward, json!({ "id": id }), |config| {
                let (_, forward) = config
                    .find_forward(id)
                    .ok_or_else(|| ValidationError::UnknownForward(id.to_string()))?;
                if !forward.enabled {
                    config.check_port_conflict(forward.ext_port, forward.protocol, Some(id))?;
                }
                let forward = config
                    .find_forward_mut(id)
                    .ok_or_else(|| ValidationError::UnknownForward(id.to_string()))?;
                forward.enabled = !forward.enabled;
                Ok(forward.enabled)
            })
            .await?;
        Ok((enabled, report))
    }

    /// Creates a bridge through the inventory, then manages it.
    ///
    /// Everything that can be checked locally is checked before the host is
    /// touched. If the inventory call fails the model is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns `Err` on invalid input, a name already managed, an uplink the
    /// inventory does not offer, an inventory failure, or a failed save.
    pub async fn declare_bridge<I: Inventory>(&self, inventory: &I, request: NewBridge) -> Result<ApplyReport> {
        let name = request.name.trim().to_string();
        validators::validate_interface_name(&name)?;
        let subnet = validators::canonical_subnet(&request.subnet)?;
        let gateway = validators::parse_ipv4(&request.gateway)?.to_string();
        let cidr = validators::cidr_from_subnet_and_gateway(&subnet, &gateway)?;
        if let Some(pool) = &request.dhcp {
            pool.validate_for(&subnet, &gateway)?;
        }
        if self.config.lock().await.find_bridge(&name).is_some() {
            return Err(ValidationError::DuplicateBridge(name).into());
        }

        let uplink = request
            .uplink
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        if let Some(uplink) = uplink {
            let networks = inventory.list_networks().await?;
            if !inventory::uplink_views(&networks).iter().any(|u| u.name == uplink) {
                return Err(ValidationError::UnknownUplink(uplink.to_string()).into());
            }
        }

        inventory.create_bridge(&name, &cidr, uplink).await?;

        let details = json!({ "bridge": name, "cidr": cidr, "uplink": uplink });
        let bridge = Bridge {
            nat_enabled: request.nat_enabled,
            dhcp: request.dhcp,
            ..Bridge::new(name, subnet, gateway)
        };
        let ((), report) = self
            .commit(EventType::DeclareBridge, details, |config| {
                if config.find_bridge(&bridge.name).is_some() {
                    return Err(ValidationError::DuplicateBridge(bridge.name.clone()).into());
                }
                config.bridges.push(bridge);
                Ok(())
            })
            .await?;
        Ok(report)
    }

    /// Manages a bridge that already exists on the host. Subnet and gateway
    /// come from the address the host has on it.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the inventory has no such bridge, the bridge has no
    /// IPv4 address, the pool is invalid, or the name is already managed.
    pub async fn attach_bridge<I: Inventory>(&self, inventory: &I, request: AttachBridge) -> Result<ApplyReport> {
        let name = request.name.trim().to_string();
        validators::validate_interface_name(&name)?;

        let networks = inventory.list_networks().await?;
        let host = networks
            .iter()
            .find(|n| n.is_bridge() && n.iface == name)
            .ok_or_else(|| Error::Inventory(format!("bridge {name} not found on host")))?;
        let cidr = host
            .effective_cidr()
            .ok_or_else(|| ValidationError::NoAddress(name.clone()))?;
        let gateway = validators::parse_cidr(&cidr)?.ip().to_string();
        let subnet = validators::canonical_subnet(&cidr)?;
        if let Some(pool) = &request.dhcp {
            pool.validate_for(&subnet, &gateway)?;
        }

        let details = json!({ "bridge": name, "cidr": cidr });
        let bridge = Bridge {
            nat_enabled: request.nat_enabled,
            dhcp: request.dhcp,
            ..Bridge::new(name, subnet, gateway)
        };
        let ((), report) = self
            .commit(EventType::AttachBridge, details, |config| {
                if config.find_bridge(&bridge.name).is_some() {
                    return Err(ValidationError::DuplicateBridge(bridge.name.clone()).into());
                }
                config.bridges.push(bridge);
                Ok(())
            })
            .await?;
        Ok(report)
    }

    /// Stops managing a bridge and drops its forwards and pool. The host
    /// interface is left in place.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the bridge is not managed or the model cannot be saved.
    pub async fn detach_bridge(&self, name: &str) -> Result<ApplyReport> {
        let ((), report) = self
            .commit(EventType::DetachBridge, json!({ "bridge": name }), |config| {
                if config.delete_bridge(name) {
                    Ok(())
                } else {
                    Err(ValidationError::UnknownBridge(name.to_string()).into())
                }
            })
            .await?;
        info!("Detached bridge {name}");
        Ok(report)
    }

    /// Replaces the DHCP pool of a bridge. The pool is validated as a whole
    /// against the bridge; a partially valid pool is never stored.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the bridge is not managed, the pool is invalid, or
    /// the model cannot be saved.
    pub async fn set_dhcp(&self, bridge: &str, pool: DhcpPool) -> Result<ApplyReport> {
        let details = json!({
            "bridge": bridge,
            "range": format!("{}-{}", pool.range_start, pool.range_end),
        });
        let ((), report) = self
            .commit(EventType::SetDhcp, details, |config| {
                let target = config
                    .find_bridge_mut(bridge)
                    .ok_or_else(|| ValidationError::UnknownBridge(bridge.to_string()))?;
                pool.validate_for(&target.subnet, &target.gateway_ip)?;
                target.dhcp = Some(pool);
                Ok(())
            })
            .await?;
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns `Err` if the bridge is not managed or the model cannot be saved.
    pub async fn clear_dhcp(&self, bridge: &str) -> Result<ApplyReport> {
        let ((), report) = self
            .commit(EventType::ClearDhcp, json!({ "bridge": bridge }), |config| {
                let target = config
                    .find_bridge_mut(bridge)
                    .ok_or_else(|| ValidationError::UnknownBridge(bridge.to_string()))?;
                target.dhcp = None;
                Ok(())
            })
            .await?;
        Ok(report)
    }

    /// Reconciles the host against the current model without changing it
    pub async fn reapply(&self) -> ApplyReport {
        let config = self.config.lock().await;
        let reconciled = self.reconcile(&config).await;
        self.audit
            .record(AuditEvent::from_report(
                EventType::Reapply,
                digests(json!({}), &reconciled),
                &reconciled.report,
            ))
            .await;
        reconciled.report
    }

    /// Points a guest NIC at a bridge through the inventory. Returns the new
    /// NIC description. The model is not involved.
    ///
    /// # Errors
    ///
    /// Returns `Err` on an invalid id, key or bridge name, a container NIC
    /// that does not exist yet, or an inventory failure.
    pub async fn set_vm_bridge<I: Inventory>(
        &self,
        inventory: &I,
        kind: VmKind,
        vmid: u32,
        key: Option<&str>,
        bridge: &str,
    ) -> Result<String> {
        let invalid = |field: &str, message: &str| ValidationError::Invalid {
            field: field.to_string(),
            message: message.to_string(),
        };
        if vmid == 0 {
            return Err(invalid("vmid", "must be positive").into());
        }
        validators::validate_interface_name(bridge)?;
        let key = key.map(str::trim).filter(|k| !k.is_empty()).unwrap_or("net0");
        if !inventory::is_net_key(key) {
            return Err(invalid("key", "must look like net0, net1, ...").into());
        }

        let current = inventory.vm_config(kind, vmid).await?;
        let value = match current.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            Some(existing) => inventory::update_bridge_in_net_string(existing, bridge),
            None if kind == VmKind::Qemu => format!("virtio,bridge={bridge}"),
            None => return Err(invalid(key, "container has no such interface to rewire").into()),
        };

        let result = inventory.set_vm_net(kind, vmid, key, &value).await;
        self.audit
            .record(AuditEvent::new(
                EventType::SetVmBridge,
                result.is_ok(),
                json!({ "kind": kind, "vmid": vmid, "key": key, "value": value }),
                result.as_ref().err().map(ToString::to_string),
            ))
            .await;
        result?;

        info!("{kind} {vmid} {key} now on {bridge}");
        Ok(value)
    }

    /// Host bridges, marked with whether they are managed
    ///
    /// # Errors
    ///
    /// Returns `Err` if the inventory cannot list networks.
    pub async fn host_bridges<I: Inventory>(&self, inventory: &I) -> Result<Vec<BridgeView>> {
        let networks = inventory.list_networks().await?;
        let config = self.config.lock().await;
        Ok(inventory::bridge_views(&networks, &config))
    }

    /// Interfaces a new bridge may use as its port
    ///
    /// # Errors
    ///
    /// Returns `Err` if the inventory cannot list networks.
    pub async fn uplinks<I: Inventory>(&self, inventory: &I) -> Result<Vec<UplinkView>> {
        let networks = inventory.list_networks().await?;
        Ok(inventory::uplink_views(&networks))
    }

    /// # Errors
    ///
    /// Returns `Err` if `nft` fails for a reason other than a missing table.
    pub async fn status(&self) -> Result<HostStatus> {
        let (wan_interface, bridges, forwards) = {
            let config = self.config.lock().await;
            (
                config.wan_interface.clone(),
                config.bridges.len(),
                config.bridges.iter().map(|b| b.forwards.len()).sum::<usize>(),
            )
        };
        Ok(HostStatus {
            wan_interface,
            bridges,
            forwards,
            nat_rules: self.nat.status().await?,
            dhcp_active: self.dhcp.is_active().await,
        })
    }

    /// # Errors
    ///
    /// Returns `Err` if the lease file exists but cannot be read.
    pub async fn leases(&self) -> Result<Vec<Lease>> {
        self.dhcp.leases().await
    }

    /// Addresses in use on every managed bridge.
    ///
    /// Guests are best-effort: if the inventory cannot list them, only
    /// gateways, forwards and leases are reported.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the lease file cannot be read.
    pub async fn used_ips<I: Inventory>(&self, inventory: &I) -> Result<Vec<BridgeUsage>> {
        let bridges = self.bridges().await;
        let leases = self.leases().await?;
        let views = self.vm_views(inventory, &leases).await;
        Ok(usage::used_ips(&bridges, &leases, &views))
    }

    /// Guest addresses per bridge, for picking a forward target
    ///
    /// # Errors
    ///
    /// Returns `Err` if the lease file cannot be read.
    pub async fn bridge_ip_options<I: Inventory>(&self, inventory: &I) -> Result<Vec<BridgeIpList>> {
        let bridges = self.bridges().await;
        let leases = self.leases().await?;
        let views = self.vm_views(inventory, &leases).await;
        Ok(usage::bridge_ip_options(&bridges, &views))
    }

    /// What the reconcilers would write for the current model
    ///
    /// # Errors
    ///
    /// Returns `Err` if the model does not compile to a NAT ruleset.
    pub async fn plan(&self) -> Result<(NatPlan, DhcpPlan)> {
        let config = self.config.lock().await;
        let nat = nat::compile(&config.bridges, &config.wan_interface)?;
        let dhcp = dhcp::compile(&config.bridges, self.dhcp.lease_file());
        Ok((nat, dhcp))
    }

    async fn vm_views<I: Inventory>(&self, inventory: &I, leases: &[Lease]) -> Vec<inventory::VmView> {
        match inventory.list_vms().await {
            Ok(vms) => usage::build_vm_views(inventory, &vms, leases).await,
            Err(e) => {
                warn!("Listing guests failed, reporting host-side usage only: {e}");
                Vec::new()
            }
        }
    }

    /// Runs `mutate` on a copy of the model, validates and saves the copy,
    /// swaps it in, then reconciles NAT followed by DHCP.
    async fn commit<T>(
        &self,
        event: EventType,
        details: serde_json::Value,
        mutate: impl FnOnce(&mut Config) -> Result<T>,
    ) -> Result<(T, ApplyReport)> {
        let mut config = self.config.lock().await;

        let mut next = config.clone();
        let value = mutate(&mut next)?;
        next.validate()?;

        if let Err(e) = next.save().await {
            error!("{e}");
            self.audit
                .record(AuditEvent::new(event, false, details, Some(e.to_string())))
                .await;
            return Err(e);
        }
        *config = next;

        let reconciled = self.reconcile(&config).await;
        self.audit
            .record(AuditEvent::from_report(
                event,
                digests(details, &reconciled),
                &reconciled.report,
            ))
            .await;
        Ok((value, reconciled.report))
    }

    async fn reconcile(&self, config: &Config) -> Reconciled {
        let mut out = Reconciled {
            report: ApplyReport::skipped(),
            nat_digest: None,
            dhcp_digest: None,
        };

        match self.nat.apply(&config.bridges, &config.wan_interface).await {
            Ok(applied) => {
                out.report.nat = applied.outcome;
                out.report.warnings.extend(applied.warnings);
                out.nat_digest = applied.digest;
            }
            Err(e) => {
                error!("NAT reconcile failed: {e}");
                out.report.nat = StepOutcome::Failed(failure_text(&e));
            }
        }

        match self.dhcp.apply(&config.bridges).await {
            Ok(applied) => {
                out.report.dhcp = applied.outcome;
                out.dhcp_digest = applied.digest;
            }
            Err(e) => {
                error!("DHCP reconcile failed: {e}");
                out.report.dhcp = StepOutcome::Failed(failure_text(&e));
            }
        }

        out
    }
}

fn failure_text(err: &Error) -> String {
    err.diagnostic()
        .map_or_else(|| err.to_string(), str::to_string)
}

fn digests(mut details: serde_json::Value, reconciled: &Reconciled) -> serde_json::Value {
    if let Some(map) = details.as_object_mut() {
        if let Some(digest) = &reconciled.nat_digest {
            map.insert("nat_digest".into(), json!(digest));
        }
        if let Some(digest) = &reconciled.dhcp_digest {
            map.insert("dhcp_digest".into(), json!(digest));
        }
    }
    details
}
