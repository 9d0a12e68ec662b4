//! Outcome of a persist-then-reconcile operation
//!
//! A mutation is committed once the model file is written. The two
//! reconcilers then run best-effort; their individual results are carried
//! here instead of being folded into a single error, so the caller sees
//! exactly which half of the host state lags behind the declaration.

use serde::Serialize;

/// Result of one reconciler step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "diagnostic", rename_all = "snake_case")]
pub enum StepOutcome {
    /// A ruleset or dnsmasq config was written and loaded
    Applied,
    /// The managed nftables table was deleted (or was already absent)
    Removed,
    /// The DHCP unit was stopped (or was never loaded)
    Stopped,
    /// The step did not run
    Skipped,
    /// The tool rejected the change; diagnostic kept verbatim
    Failed(String),
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            StepOutcome::Failed(msg) => Some(msg),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepOutcome::Applied => write!(f, "applied"),
            StepOutcome::Removed => write!(f, "removed"),
            StepOutcome::Stopped => write!(f, "stopped"),
            StepOutcome::Skipped => write!(f, "skipped"),
            StepOutcome::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

/// Combined result of the NAT and DHCP reconcilers after a committed mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub nat: StepOutcome,
    pub dhcp: StepOutcome,
    /// Non-fatal problems, e.g. ip_forward could not be persisted
    pub warnings: Vec<String>,
}

impl ApplyReport {
    /// Report before any reconciler has run
    pub fn skipped() -> Self {
        Self {
            nat: StepOutcome::Skipped,
            dhcp: StepOutcome::Skipped,
            warnings: Vec::new(),
        }
    }

    /// True when live host state matches the persisted model
    pub fn is_complete(&self) -> bool {
        !self.nat.is_failure() && !self.dhcp.is_failure()
    }

    /// Diagnostics of the failed steps, NAT first
    pub fn failures(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Some(msg) = self.nat.diagnostic() {
            out.push(("nat", msg));
        }
        if let Some(msg) = self.dhcp.diagnostic() {
            out.push(("dhcp", msg));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_completeness() {
        let mut report = ApplyReport {
            nat: StepOutcome::Applied,
            dhcp: StepOutcome::Stopped,
            warnings: vec!["could not persist ip_forward".into()],
        };
        assert!(report.is_complete());
        assert!(report.failures().is_empty());

        report.dhcp = StepOutcome::Failed("Job for natctl-dnsmasq.service failed".into());
        assert!(!report.is_complete());
        assert_eq!(report.failures(), vec![("dhcp", "Job for natctl-dnsmasq.service failed")]);
    }

    #[test]
    fn test_skipped_report_is_complete() {
        assert!(ApplyReport::skipped().is_complete());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(StepOutcome::Failed("boom".into())).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["diagnostic"], "boom");
        let json = serde_json::to_value(StepOutcome::Applied).unwrap();
        assert_eq!(json["status"], "applied");
    }
}
