//! External tool invocation
//!
//! natctl never links against netfilter or systemd; it drives `nft`,
//! `systemctl` and `ip` as child processes. Every invocation captures the
//! combined stdout/stderr so the diagnostic can be surfaced verbatim.
//!
//! Program paths come from [`Tools`], which defaults to the system binaries
//! and honours `NATCTL_NFT_COMMAND`, `NATCTL_SYSTEMCTL_COMMAND` and
//! `NATCTL_IP_COMMAND` for packagers and tests.

use crate::core::error::{Error, Result};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error};

/// Diagnostics `nft` prints when the managed table is not loaded
pub const NFT_ABSENT_PATTERNS: &[&str] = &["No such file or directory", "does not exist"];

/// Diagnostics `systemctl` prints when the unit is not installed or loaded
pub const UNIT_ABSENT_PATTERNS: &[&str] = &["not loaded", "not found"];

/// Program paths for the external tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tools {
    pub nft: String,
    pub systemctl: String,
    pub ip: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            nft: "/usr/sbin/nft".to_string(),
            systemctl: "systemctl".to_string(),
            ip: "ip".to_string(),
        }
    }
}

impl Tools {
    /// System defaults, overridden by the `NATCTL_*_COMMAND` variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let pick = |var: &str, fallback: String| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(fallback)
        };
        Self {
            nft: pick("NATCTL_NFT_COMMAND", defaults.nft),
            systemctl: pick("NATCTL_SYSTEMCTL_COMMAND", defaults.systemctl),
            ip: pick("NATCTL_IP_COMMAND", defaults.ip),
        }
    }
}

/// Result of one finished tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub tool: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr, unmodified
    pub output: String,
}

impl ToolOutput {
    /// True if the diagnostic matches one of the absence patterns
    pub fn reports_absence(&self, patterns: &[&str]) -> bool {
        patterns.iter().any(|p| self.output.contains(p))
    }

    /// Converts a non-zero exit into [`Error::ApplyFailed`] carrying the
    /// trimmed diagnostic.
    pub fn check(self) -> Result<String> {
        if self.success {
            Ok(self.output)
        } else {
            Err(self.into_error())
        }
    }

    pub fn into_error(self) -> Error {
        Error::ApplyFailed {
            tool: self.tool,
            diagnostic: self.output.trim().to_string(),
            exit_code: self.exit_code,
        }
    }
}

/// Runs `program args...` to completion.
///
/// A program that cannot be spawned at all is reported as
/// [`Error::ApplyFailed`] with no exit code; its message is never matched
/// against absence patterns.
pub async fn run(program: &str, args: &[&str]) -> Result<ToolOutput> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            error!("Failed to spawn {program}: {e}");
            Error::ApplyFailed {
                tool: program.to_string(),
                diagnostic: format!("failed to spawn {program}: {e}"),
                exit_code: None,
            }
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ToolOutput {
        tool: tool_name(program).to_string(),
        success: output.status.success(),
        exit_code: output.status.code(),
        output: combined,
    })
}

/// Final path component, so diagnostics read `nft failed` not `/usr/sbin/nft failed`
fn tool_name(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}
