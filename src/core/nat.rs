//! NAT ruleset compiler and reconciler
//!
//! The model is compiled into a typed [`NatRuleset`] first. Each record is
//! validated while it is built (nonzero ports, parsable addresses, sane
//! interface name, sanitized comment) and only then serialized, so quoting
//! mistakes in operator input cannot reach `nft`.
//!
//! The ruleset lives in its own `ip natctl` table. Loading it is a single
//! `nft -f` transaction that adds, flushes and refills the table, so rules
//! never exist half-applied.

use crate::config::HostPaths;
use crate::core::error::{Error, Result, ValidationError};
use crate::core::model::{Bridge, Transport};
use crate::core::report::StepOutcome;
use crate::core::tool::{self, NFT_ABSENT_PATTERNS, Tools};
use crate::utils;
use crate::validators::{self, parse_cidr, parse_ipv4, sanitize_comment};
use ipnetwork::Ipv4Network;
use std::fmt::{self, Write as _};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{info, warn};

pub const TABLE_FAMILY: &str = "ip";
pub const TABLE_NAME: &str = "natctl";
pub const MANAGED_HEADER: &str = "# Managed by natctl - do not edit manually";

/// Returned by [`NatReconciler::status`] when the table is not loaded
pub const NO_RULES_LOADED: &str = "(no rules loaded)";

const SYSCTL_CONTENT: &str = "# Managed by natctl\nnet.ipv4.ip_forward = 1\n";

/// Destination-NAT rule in the `prerouting` chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnatRule {
    pub wan: String,
    pub transport: Transport,
    pub ext_port: u16,
    pub int_ip: Ipv4Addr,
    pub int_port: u16,
    pub comment: Option<String>,
}

impl fmt::Display for DnatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iifname \"{}\" {} dport {} dnat to {}:{}",
            self.wan, self.transport, self.ext_port, self.int_ip, self.int_port
        )?;
        if let Some(comment) = &self.comment {
            write!(f, " comment \"{comment}\"")?;
        }
        Ok(())
    }
}

/// Source masquerade rule in the `postrouting` chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasqueradeRule {
    pub wan: String,
    pub subnet: Ipv4Network,
}

impl fmt::Display for MasqueradeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "oifname \"{}\" ip saddr {}/{} masquerade",
            self.wan,
            self.subnet.network(),
            self.subnet.prefix()
        )
    }
}

/// Validated rules for the managed table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatRuleset {
    pub prerouting: Vec<DnatRule>,
    pub postrouting: Vec<MasqueradeRule>,
}

impl NatRuleset {
    /// Serializes the ruleset as an `nft -f` script.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let table = format!("{TABLE_FAMILY} {TABLE_NAME}");

        let _ = writeln!(out, "{MANAGED_HEADER}");
        let _ = writeln!(out, "add table {table}");
        let _ = writeln!(out, "flush table {table}\n");
        let _ = writeln!(out, "table {table} {{");

        let _ = writeln!(out, "    chain prerouting {{");
        let _ = writeln!(out, "        type nat hook prerouting priority dstnat; policy accept;");
        for rule in &self.prerouting {
            let _ = writeln!(out, "        {rule}");
        }
        let _ = writeln!(out, "    }}\n");

        let _ = writeln!(out, "    chain postrouting {{");
        let _ = writeln!(out, "        type nat hook postrouting priority srcnat; policy accept;");
        for rule in &self.postrouting {
            let _ = writeln!(out, "        {rule}");
        }
        let _ = writeln!(out, "    }}");
        let _ = writeln!(out, "}}");
        out
    }
}

/// What the NAT reconciler will do for a given model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatPlan {
    /// No NAT and no enabled forward anywhere: drop the managed table
    RemoveTable,
    Ruleset(NatRuleset),
}

impl NatPlan {
    /// Script text for a ruleset plan, `None` for removal
    pub fn render(&self) -> Option<String> {
        match self {
            NatPlan::RemoveTable => None,
            NatPlan::Ruleset(rules) => Some(rules.render()),
        }
    }
}

/// Compiles the bridge list into a NAT plan.
///
/// Bridges and forwards are emitted in model order, so identical models
/// always produce byte-identical scripts.
///
/// # Errors
///
/// Returns `Err` if the WAN interface name is unusable, or a NAT-enabled
/// bridge or enabled forward carries a value that does not parse.
pub fn compile(bridges: &[Bridge], wan: &str) -> std::result::Result<NatPlan, ValidationError> {
    let any_nat = bridges.iter().any(|b| b.nat_enabled);
    let any_forward = bridges.iter().any(|b| b.enabled_forwards().next().is_some());
    if !any_nat && !any_forward {
        return Ok(NatPlan::RemoveTable);
    }

    let wan = wan.trim();
    validators::validate_host_interface(wan)?;

    let mut rules = NatRuleset::default();

    for bridge in bridges {
        for forward in bridge.enabled_forwards() {
            let ext_port = validators::validate_port("ext_port", forward.ext_port)?;
            let int_port = validators::validate_port("int_port", forward.int_port)?;
            let int_ip = parse_ipv4(&forward.int_ip)?;
            let comment = Some(sanitize_comment(&forward.comment)).filter(|c| !c.is_empty());

            for &transport in forward.protocol.transports() {
                rules.prerouting.push(DnatRule {
                    wan: wan.to_string(),
                    transport,
                    ext_port,
                    int_ip,
                    int_port,
                    comment: comment.clone(),
                });
            }
        }
    }

    for bridge in bridges.iter().filter(|b| b.nat_enabled) {
        let subnet = parse_cidr(&bridge.subnet)?;
        rules.postrouting.push(MasqueradeRule {
            wan: wan.to_string(),
            subnet,
        });
    }

    Ok(NatPlan::Ruleset(rules))
}

/// Result of one NAT reconcile pass
#[derive(Debug, Clone)]
pub struct NatApplied {
    pub outcome: StepOutcome,
    /// SHA-256 of the loaded script, absent when the table was removed
    pub digest: Option<String>,
    pub warnings: Vec<String>,
}

/// Drives `nft` and the ip_forward sysctl toward a compiled plan
#[derive(Debug, Clone)]
pub struct NatReconciler {
    nft: String,
    rules_dir: PathBuf,
    rules_file: PathBuf,
    sysctl_file: PathBuf,
    ip_forward: PathBuf,
}

impl NatReconciler {
    pub fn new(tools: &Tools, paths: &HostPaths) -> Self {
        Self {
            nft: tools.nft.clone(),
            rules_dir: paths.rules_dir.clone(),
            rules_file: paths.rules_file.clone(),
            sysctl_file: paths.sysctl_file.clone(),
            ip_forward: paths.ip_forward.clone(),
        }
    }

    pub fn rules_file(&self) -> &std::path::Path {
        &self.rules_file
    }

    /// Makes the live `ip natctl` table match the model.
    ///
    /// IP forwarding is switched on whenever any bridge has NAT; failures to
    /// do so come back as warnings, not errors.
    ///
    /// # Errors
    ///
    /// Returns `Err` if compilation fails, the script cannot be written, or
    /// `nft` exits non-zero.
    pub async fn apply(&self, bridges: &[Bridge], wan: &str) -> Result<NatApplied> {
        let plan = compile(bridges, wan)?;

        let mut warnings = Vec::new();
        if bridges.iter().any(|b| b.nat_enabled) {
            warnings.extend(self.enable_ip_forward().await);
        }

        let NatPlan::Ruleset(rules) = plan else {
            self.remove().await?;
            return Ok(NatApplied {
                outcome: StepOutcome::Removed,
                digest: None,
                warnings,
            });
        };

        let script = rules.render();
        utils::ensure_dir(&self.rules_dir, 0o755)
            .await
            .map_err(|source| Error::Persist {
                path: self.rules_dir.clone(),
                source,
            })?;
        utils::write_atomic(&self.rules_file, script.as_bytes(), 0o644)
            .await
            .map_err(|source| Error::Persist {
                path: self.rules_file.clone(),
                source,
            })?;

        let rules_file = self.rules_file.to_string_lossy();
        tool::run(&self.nft, &["-f", &rules_file]).await?.check()?;

        info!(
            "nftables rules applied ({} dnat, {} masquerade)",
            rules.prerouting.len(),
            rules.postrouting.len()
        );
        Ok(NatApplied {
            outcome: StepOutcome::Applied,
            digest: Some(utils::sha256_hex(&script)),
            warnings,
        })
    }

    /// Deletes the managed table. A table that is already gone is success.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `nft` fails for any other reason.
    pub async fn remove(&self) -> Result<()> {
        let out = tool::run(&self.nft, &["delete", "table", TABLE_FAMILY, TABLE_NAME]).await?;
        if out.success {
            info!("nftables table {TABLE_FAMILY} {TABLE_NAME} removed");
            return Ok(());
        }
        if out.reports_absence(NFT_ABSENT_PATTERNS) {
            return Ok(());
        }
        Err(out.into_error())
    }

    /// Live contents of the managed table, or [`NO_RULES_LOADED`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if `nft` fails for a reason other than a missing table.
    pub async fn status(&self) -> Result<String> {
        let out = tool::run(&self.nft, &["list", "table", TABLE_FAMILY, TABLE_NAME]).await?;
        if out.success {
            return Ok(out.output);
        }
        if out.reports_absence(NFT_ABSENT_PATTERNS) {
            return Ok(NO_RULES_LOADED.to_string());
        }
        Err(out.into_error())
    }

    async fn enable_ip_forward(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = tokio::fs::write(&self.ip_forward, b"1").await {
            let msg = format!("failed to enable ip_forward via {}: {e}", self.ip_forward.display());
            warn!("{msg}");
            warnings.push(msg);
        }

        if let Err(e) = self.persist_ip_forward().await {
            let msg = format!("failed to persist ip_forward in {}: {e}", self.sysctl_file.display());
            warn!("{msg}");
            warnings.push(msg);
        }

        warnings
    }

    async fn persist_ip_forward(&self) -> std::io::Result<()> {
        if let Some(parent) = self.sysctl_file.parent() {
            utils::ensure_dir(parent, 0o755).await?;
        }
        utils::write_atomic(&self.sysctl_file, SYSCTL_CONTENT.as_bytes(), 0o644).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{PortForward, Protocol};
    use crate::core::test_helpers::{MockTools, bridge_with_forward, forward, test_paths};

    #[test]
    fn test_compile_nothing_enabled_removes_table() {
        assert_eq!(compile(&[], "vmbr0").unwrap(), NatPlan::RemoveTable);

        let mut bridge = bridge_with_forward("vmbr1", "10.10.10.0/24", "10.10.10.1");
        bridge.forwards[0].enabled = false;
        assert_eq!(compile(&[bridge], "vmbr0").unwrap(), NatPlan::RemoveTable);
    }

    #[test]
    fn test_compile_forward_without_nat_still_emits_dnat() {
        let bridge = bridge_with_forward("vmbr1", "10.10.10.0/24", "10.10.10.1");
        let NatPlan::Ruleset(rules) = compile(&[bridge], "vmbr0").unwrap() else {
            panic!("expected ruleset");
        };
        assert_eq!(rules.prerouting.len(), 1);
        assert!(rules.postrouting.is_empty());
    }

    #[test]
    fn test_tcp_udp_expands_to_two_rules() {
        let mut bridge = Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1");
        bridge.forwards.push(forward(Protocol::TcpAndUdp, 53, "10.10.10.53", 53));

        let NatPlan::Ruleset(rules) = compile(&[bridge], "vmbr0").unwrap() else {
            panic!("expected ruleset");
        };
        assert_eq!(rules.prerouting.len(), 2);
        let (tcp, udp) = (&rules.prerouting[0], &rules.prerouting[1]);
        assert_eq!(tcp.transport, Transport::Tcp);
        assert_eq!(udp.transport, Transport::Udp);
        assert_eq!(
            DnatRule {
                transport: Transport::Tcp,
                ..udp.clone()
            },
            *tcp
        );
    }

    #[test]
    fn test_end_to_end_vmbr1_script() {
        let mut bridge = Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1");
        bridge.nat_enabled = true;
        bridge.forwards.push(PortForward {
            comment: "ssh".into(),
            ..forward(Protocol::Tcp, 2222, "10.10.10.101", 22)
        });

        let script = compile(&[bridge], "vmbr0").unwrap().render().unwrap();
        let expected = "\
# Managed by natctl - do not edit manually
add table ip natctl
flush table ip natctl

table ip natctl {
    chain prerouting {
        type nat hook prerouting priority dstnat; policy accept;
        iifname \"vmbr0\" tcp dport 2222 dnat to 10.10.10.101:22 comment \"ssh\"
    }

    chain postrouting {
        type nat hook postrouting priority srcnat; policy accept;
        oifname \"vmbr0\" ip saddr 10.10.10.0/24 masquerade
    }
}
";
        assert_eq!(script, expected);
    }

    #[test]
    fn test_comment_is_sanitized() {
        let mut bridge = Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1");
        bridge.forwards.push(PortForward {
            comment: "web\" ; flush ruleset ; \"".into(),
            ..forward(Protocol::Tcp, 80, "10.10.10.2", 80)
        });
        let script = compile(&[bridge], "vmbr0").unwrap().render().unwrap();
        assert!(script.contains("comment \"web ; flush ruleset ;\""));
    }

    #[test]
    fn test_compile_rejects_bad_wan_and_addresses() {
        let bridge = bridge_with_forward("vmbr1", "10.10.10.0/24", "10.10.10.1");
        assert!(compile(std::slice::from_ref(&bridge), "").is_err());
        assert!(compile(std::slice::from_ref(&bridge), "eth0\" accept").is_err());

        let mut broken = bridge;
        broken.forwards[0].int_ip = "10.10.10".into();
        assert!(matches!(
            compile(&[broken], "vmbr0"),
            Err(ValidationError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let mut a = bridge_with_forward("vmbr1", "10.10.10.0/24", "10.10.10.1");
        a.nat_enabled = true;
        let mut b = bridge_with_forward("vmbr2", "10.20.0.0/16", "10.20.0.1");
        b.nat_enabled = true;
        b.forwards[0].ext_port = 8443;
        let bridges = vec![a, b];

        let first = compile(&bridges, "vmbr0").unwrap().render();
        let second = compile(&bridges, "vmbr0").unwrap().render();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_apply_writes_script_and_loads_it() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let mock = MockTools::new(dir.path());
        let nat = NatReconciler::new(&mock.tools, &paths);

        let mut bridge = bridge_with_forward("vmbr1", "10.10.10.0/24", "10.10.10.1");
        bridge.nat_enabled = true;

        let applied = nat.apply(&[bridge], "vmbr0").await.unwrap();
        assert_eq!(applied.outcome, StepOutcome::Applied);
        assert!(applied.digest.is_some());
        assert!(applied.warnings.is_empty(), "{:?}", applied.warnings);

        let script = std::fs::read_to_string(&paths.rules_file).unwrap();
        assert!(script.starts_with(MANAGED_HEADER));
        assert_eq!(std::fs::read_to_string(&paths.ip_forward).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(&paths.sysctl_file).unwrap(), SYSCTL_CONTENT);

        let calls = mock.nft_calls();
        assert_eq!(calls, vec![format!("-f {}", paths.rules_file.display())]);
    }

    #[tokio::test]
    async fn test_apply_nothing_deletes_table() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let mock = MockTools::new(dir.path());
        let nat = NatReconciler::new(&mock.tools, &paths);

        let applied = nat.apply(&[], "vmbr0").await.unwrap();
        assert_eq!(applied.outcome, StepOutcome::Removed);
        assert_eq!(mock.nft_calls(), vec!["delete table ip natctl".to_string()]);
        assert!(!paths.ip_forward.exists());
    }

    #[tokio::test]
    async fn test_remove_absent_table_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let mock = MockTools::new(dir.path());
        mock.fail_nft("Error: Could not process rule: No such file or directory");
        let nat = NatReconciler::new(&mock.tools, &paths);

        assert!(nat.remove().await.is_ok());
        assert_eq!(nat.status().await.unwrap(), NO_RULES_LOADED);
    }

    #[tokio::test]
    async fn test_apply_failure_carries_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let mock = MockTools::new(dir.path());
        mock.fail_nft("rules.nft:8:9-15: Error: syntax error");
        let nat = NatReconciler::new(&mock.tools, &paths);

        let bridge = bridge_with_forward("vmbr1", "10.10.10.0/24", "10.10.10.1");
        let err = nat.apply(&[bridge], "vmbr0").await.unwrap_err();
        assert_eq!(err.diagnostic(), Some("rules.nft:8:9-15: Error: syntax error"));
    }

    #[tokio::test]
    async fn test_ip_forward_failure_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = test_paths(dir.path());
        paths.ip_forward = dir.path().join("no-such-dir").join("ip_forward");
        let mock = MockTools::new(dir.path());
        let nat = NatReconciler::new(&mock.tools, &paths);

        let mut bridge = Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1");
        bridge.nat_enabled = true;

        let applied = nat.apply(&[bridge], "vmbr0").await.unwrap();
        assert_eq!(applied.outcome, StepOutcome::Applied);
        assert_eq!(applied.warnings.len(), 1);
        assert!(applied.warnings[0].contains("ip_forward"));
    }

    #[tokio::test]
    async fn test_sysctl_dir_failure_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = test_paths(dir.path());
        // A regular file where the sysctl.d directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        paths.sysctl_file = blocker.join("sysctl.d").join("90-natctl.conf");
        let mock = MockTools::new(dir.path());
        let nat = NatReconciler::new(&mock.tools, &paths);

        let mut bridge = Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1");
        bridge.nat_enabled = true;

        let applied = nat.apply(&[bridge], "vmbr0").await.unwrap();
        assert_eq!(applied.outcome, StepOutcome::Applied);
        assert_eq!(applied.warnings.len(), 1);
        assert!(applied.warnings[0].contains("failed to persist ip_forward"));
        assert_eq!(std::fs::read_to_string(&paths.ip_forward).unwrap(), "1");
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::core::model::{PortForward, Protocol};
    use proptest::prelude::*;

    fn arb_protocol() -> impl Strategy<Value = Protocol> {
        prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp), Just(Protocol::TcpAndUdp)]
    }

    proptest! {
        #[test]
        fn test_rule_count_matches_expansion(
            specs in prop::collection::vec((arb_protocol(), 1u16..=65535, any::<bool>()), 0..12),
            nat in any::<bool>(),
        ) {
            let mut bridge = Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1");
            bridge.nat_enabled = nat;
            for (i, (protocol, port, enabled)) in specs.iter().enumerate() {
                bridge.forwards.push(PortForward {
                    id: format!("f{i}"),
                    protocol: *protocol,
                    ext_port: *port,
                    int_ip: "10.10.10.10".into(),
                    int_port: 80,
                    comment: String::new(),
                    enabled: *enabled,
                });
            }

            let expected: usize = specs
                .iter()
                .filter(|(_, _, enabled)| *enabled)
                .map(|(p, _, _)| p.transports().len())
                .sum();

            match compile(&[bridge], "vmbr0").unwrap() {
                NatPlan::RemoveTable => prop_assert!(!nat && expected == 0),
                NatPlan::Ruleset(rules) => {
                    prop_assert_eq!(rules.prerouting.len(), expected);
                    prop_assert_eq!(rules.postrouting.len(), usize::from(nat));
                }
            }
        }
    }
}
