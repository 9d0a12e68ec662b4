use std::path::PathBuf;
use thiserror::Error;

/// Core error types for natctl
#[derive(Debug, Error)]
pub enum Error {
    /// Input or model validation failed; nothing was mutated
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Writing or renaming the persisted model failed; the previous file is intact
    #[error("Failed to persist {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external tool exited non-zero; the model is already persisted
    #[error("{tool} failed: {diagnostic}")]
    ApplyFailed {
        tool: String,
        diagnostic: String,
        exit_code: Option<i32>,
    },

    /// The persisted config could not be read or is inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// The inventory backend refused or failed a request
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Diagnostic text of an apply failure, verbatim from the tool
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Error::ApplyFailed { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}

impl From<RangeError> for Error {
    fn from(err: RangeError) -> Self {
        Error::Validation(ValidationError::Range(err))
    }
}

/// Range check failures, in the order `validate_range` tests them
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("bridge subnet invalid")]
    SubnetInvalid,

    #[error("invalid range start or end address")]
    AddressInvalid,

    #[error("range must be within bridge subnet")]
    RangeOutsideSubnet,

    #[error("range start must be <= range end")]
    RangeInverted,

    #[error("range must not include the gateway address")]
    RangeIncludesGateway,
}

/// Rejections raised before any mutation takes place
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid IPv4 CIDR {0:?}")]
    InvalidCidr(String),

    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),

    #[error("invalid netmask {0:?}")]
    InvalidNetmask(String),

    #[error("invalid interface name {0:?}")]
    InvalidInterfaceName(String),

    #[error("{field} must be between 1 and 65535")]
    InvalidPort { field: &'static str },

    #[error("invalid lease time {0:?}")]
    InvalidLeaseTime(String),

    #[error("invalid protocol {0:?} (expected tcp, udp or tcp+udp)")]
    InvalidProtocol(String),

    #[error("DHCP {0}")]
    Range(RangeError),

    #[error("gateway {gateway} is not inside subnet {subnet}")]
    GatewayOutsideSubnet { gateway: String, subnet: String },

    #[error("internal address {address} is not inside bridge subnet {subnet}")]
    AddressOutsideSubnet { address: String, subnet: String },

    #[error("external port {port}/{protocol} already in use by forward {existing}")]
    PortConflict {
        port: u16,
        protocol: String,
        existing: String,
    },

    #[error("bridge {0} is already managed")]
    DuplicateBridge(String),

    #[error("bridge {0} is not managed")]
    UnknownBridge(String),

    #[error("forward {0} not found")]
    UnknownForward(String),

    #[error("uplink {0} is not an available bridge port")]
    UnknownUplink(String),

    #[error("bridge {0} has no IPv4 address configured on the host")]
    NoAddress(String),

    #[error("{field}: {message}")]
    Invalid { field: String, message: String },
}

/// Represents a translated diagnostic with helpful context
#[derive(Debug, Clone)]
pub struct DiagnosticHint {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl DiagnosticHint {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Matches an nft/systemctl diagnostic against known patterns.
    pub fn for_diagnostic(msg: &str) -> Self {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return Self::new("Insufficient permissions to change host network state")
                .with_suggestion("Run natctl as root or from its systemd unit")
                .with_suggestion("Check that CAP_NET_ADMIN is available");
        }

        if lower.contains("command not found")
            || (lower.contains("spawn") && lower.contains("no such file or directory"))
        {
            return Self::new("A required system tool is not installed")
                .with_suggestion("Install nftables and dnsmasq")
                .with_suggestion("Or point NATCTL_NFT_COMMAND / NATCTL_SYSTEMCTL_COMMAND at the binaries");
        }

        if lower.contains("syntax error") || lower.contains("could not process rule") {
            return Self::new("The generated ruleset was rejected by nft")
                .with_suggestion("Inspect the compiled output with: natctl plan")
                .with_suggestion("Check the WAN interface name and forward addresses");
        }

        if lower.contains("interface") && lower.contains("does not exist") {
            return Self::new("Network interface not found")
                .with_suggestion("Check available interfaces: ip link show")
                .with_suggestion("Interface names are case-sensitive and max 15 chars");
        }

        if lower.contains("address already in use") || lower.contains("failed to create listening") {
            return Self::new("dnsmasq could not bind its DHCP socket")
                .with_suggestion("Another DHCP server may be running on the bridge")
                .with_suggestion("Check: ss -ulpn 'sport = :67'");
        }

        if lower.contains("job for") && lower.contains("failed") {
            return Self::new("The DHCP service failed to start")
                .with_suggestion("Check: journalctl -u natctl-dnsmasq.service");
        }

        if lower.contains("resource busy") {
            return Self::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion("Wait a moment and re-run: natctl apply");
        }

        if lower.contains("netlink") {
            return Self::new("Communication error with kernel netlink interface")
                .with_suggestion("Load nf_tables module: modprobe nf_tables");
        }

        Self::new(format!("External tool error: {msg}"))
            .with_suggestion("Re-run the action or natctl apply once the cause is fixed")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
