/// Audit logging for host-changing operations
///
/// Every committed mutation and every reconcile pass is recorded as one
/// JSON line, including partial failures, so the operator can tell which
/// declaration was live at any point in time.
use crate::core::report::ApplyReport;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InitConfig,
    ToggleNat,
    AddForward,
    DeleteForward,
    ToggleForward,
    DeclareBridge,
    AttachBridge,
    DetachBridge,
    SetDhcp,
    ClearDhcp,
    Reapply,
    SetVmBridge,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Whether host state now matches the declaration
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }

    /// Event for a committed mutation; `details` gains the step outcomes
    pub fn from_report(event_type: EventType, mut details: serde_json::Value, report: &ApplyReport) -> Self {
        if let Some(map) = details.as_object_mut() {
            map.insert("nat".into(), serde_json::json!(report.nat));
            map.insert("dhcp".into(), serde_json::json!(report.dhcp));
            if !report.warnings.is_empty() {
                map.insert("warnings".into(), serde_json::json!(report.warnings));
            }
        }
        let error = report
            .failures()
            .into_iter()
            .map(|(step, msg)| format!("{step}: {msg}"))
            .reduce(|a, b| format!("{a}; {b}"));
        Self::new(event_type, report.is_complete(), details, error)
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        if let Some(parent) = self.log_path.parent() {
            crate::utils::ensure_dir(parent, 0o750).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o640)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Writes an event, downgrading failure to a warning
    pub async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(&event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}
