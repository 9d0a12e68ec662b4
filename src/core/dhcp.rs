//! dnsmasq configuration compiler and service reconciler
//!
//! dnsmasq runs DHCP-only (`port=0`) under a dedicated systemd unit. The
//! whole configuration is regenerated from the model on every apply; the
//! unit is restarted to pick it up, or stopped when no bridge serves DHCP.

use crate::config::HostPaths;
use crate::core::error::{Error, Result};
use crate::core::model::{Bridge, Lease};
use crate::core::report::StepOutcome;
use crate::core::tool::{self, Tools, UNIT_ABSENT_PATTERNS};
use crate::utils;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DNSMASQ_UNIT: &str = "natctl-dnsmasq.service";
pub const MANAGED_HEADER: &str = "# Managed by natctl - do not edit manually";

/// What the DHCP reconciler will do for a given model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpPlan {
    /// No bridge has a pool: stop the unit
    Stop,
    /// Full dnsmasq configuration text
    Config(String),
}

/// Compiles the dnsmasq configuration.
///
/// `lease_file` is embedded as `dhcp-leasefile=`. Bridges without a pool
/// contribute nothing, not even a comment.
pub fn compile(bridges: &[Bridge], lease_file: &Path) -> DhcpPlan {
    if bridges.iter().all(|b| b.dhcp.is_none()) {
        return DhcpPlan::Stop;
    }

    let mut out = String::new();
    let _ = writeln!(out, "{MANAGED_HEADER}");
    let _ = writeln!(out, "bind-interfaces");
    let _ = writeln!(out, "port=0");
    let _ = writeln!(out, "keep-in-foreground");
    let _ = writeln!(out, "no-daemon");
    let _ = writeln!(out, "dhcp-leasefile={}", lease_file.display());
    let _ = writeln!(out);

    for bridge in bridges {
        let Some(pool) = &bridge.dhcp else {
            continue;
        };
        let name = &bridge.name;

        let _ = writeln!(out, "# Bridge {name}");
        let _ = writeln!(out, "interface={name}");
        let _ = writeln!(
            out,
            "dhcp-range={name},{},{},{}",
            pool.range_start, pool.range_end, pool.lease_time
        );
        let _ = writeln!(out, "dhcp-option={name},3,{}", bridge.gateway_ip);

        let dns = pool.dns_servers();
        if !dns.is_empty() {
            let _ = writeln!(out, "dhcp-option={name},6,{}", dns.join(","));
        }
        let _ = writeln!(out);
    }

    DhcpPlan::Config(out)
}

/// Parses dnsmasq lease-file text.
///
/// Each line is `timestamp mac ip hostname [client-id]`; lines with fewer
/// than four fields are skipped.
pub fn parse_leases(text: &str) -> Vec<Lease> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let timestamp = fields.next()?;
            let mac = fields.next()?;
            let ip = fields.next()?;
            let hostname = fields.next()?;
            Some(Lease {
                timestamp: timestamp.to_string(),
                mac: mac.to_string(),
                ip: ip.to_string(),
                hostname: hostname.to_string(),
            })
        })
        .collect()
}

/// Result of one DHCP reconcile pass
#[derive(Debug, Clone)]
pub struct DhcpApplied {
    pub outcome: StepOutcome,
    pub digest: Option<String>,
}

/// Drives the dnsmasq unit toward a compiled plan
#[derive(Debug, Clone)]
pub struct DhcpReconciler {
    systemctl: String,
    config_file: PathBuf,
    lease_file: PathBuf,
}

impl DhcpReconciler {
    pub fn new(tools: &Tools, paths: &HostPaths) -> Self {
        Self {
            systemctl: tools.systemctl.clone(),
            config_file: paths.dnsmasq_config.clone(),
            lease_file: paths.lease_file.clone(),
        }
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn lease_file(&self) -> &Path {
        &self.lease_file
    }

    /// Compiles against this reconciler's lease file path
    pub fn plan(&self, bridges: &[Bridge]) -> DhcpPlan {
        compile(bridges, &self.lease_file)
    }

    /// Makes the dnsmasq unit match the model.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the config cannot be written or `systemctl` exits
    /// non-zero (other than for a unit that is not loaded on stop).
    pub async fn apply(&self, bridges: &[Bridge]) -> Result<DhcpApplied> {
        let config = match self.plan(bridges) {
            DhcpPlan::Stop => {
                self.stop().await?;
                return Ok(DhcpApplied {
                    outcome: StepOutcome::Stopped,
                    digest: None,
                });
            }
            DhcpPlan::Config(config) => config,
        };

        if let Some(parent) = self.config_file.parent() {
            utils::ensure_dir(parent, 0o755)
                .await
                .map_err(|source| Error::Persist {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        utils::write_atomic(&self.config_file, config.as_bytes(), 0o644)
            .await
            .map_err(|source| Error::Persist {
                path: self.config_file.clone(),
                source,
            })?;

        tool::run(&self.systemctl, &["restart", DNSMASQ_UNIT])
            .await?
            .check()?;

        info!("dnsmasq config applied and {DNSMASQ_UNIT} restarted");
        Ok(DhcpApplied {
            outcome: StepOutcome::Applied,
            digest: Some(utils::sha256_hex(&config)),
        })
    }

    /// Stops the unit; a unit that is not installed counts as stopped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `systemctl stop` fails for any other reason.
    pub async fn stop(&self) -> Result<()> {
        let out = tool::run(&self.systemctl, &["stop", DNSMASQ_UNIT]).await?;
        if out.success || out.reports_absence(UNIT_ABSENT_PATTERNS) {
            debug!("{DNSMASQ_UNIT} stopped");
            return Ok(());
        }
        Err(out.into_error())
    }

    /// Whether the unit is currently running
    pub async fn is_active(&self) -> bool {
        tool::run(&self.systemctl, &["is-active", "--quiet", DNSMASQ_UNIT])
            .await
            .is_ok_and(|out| out.success)
    }

    /// Active leases; a missing lease file means no leases.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the lease file exists but cannot be read.
    pub async fn leases(&self) -> Result<Vec<Lease>> {
        match tokio::fs::read_to_string(&self.lease_file).await {
            Ok(text) => Ok(parse_leases(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
