//! Declarative network model
//!
//! A [`Bridge`] owns its optional [`DhcpPool`] and its ordered list of
//! [`PortForward`]s by value. Addresses are kept in their persisted text
//! form so that a hand-edited file is rejected by validation with a precise
//! message rather than by the deserializer; accessors parse on demand.

use crate::core::error::ValidationError;
use crate::validators::{self, parse_cidr, parse_ipv4};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Lease duration used when a pool is saved without one
pub const DEFAULT_LEASE_TIME: &str = "12h";

/// Forward protocol as declared by the operator
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Protocol {
    #[serde(rename = "tcp")]
    #[strum(serialize = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    #[strum(serialize = "udp")]
    Udp,
    /// Both TCP and UDP; compiles to one rule per transport
    #[serde(rename = "tcp+udp")]
    #[strum(serialize = "tcp+udp", serialize = "both")]
    TcpAndUdp,
}

/// A single layer-4 transport as it appears in a compiled rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum Transport {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    /// Transports this protocol expands to, in compile order
    pub const fn transports(self) -> &'static [Transport] {
        match self {
            Protocol::Tcp => &[Transport::Tcp],
            Protocol::Udp => &[Transport::Udp],
            Protocol::TcpAndUdp => &[Transport::Tcp, Transport::Udp],
        }
    }

    /// Two protocols collide on a port unless their transport sets are disjoint.
    /// `tcp` and `udp` are independent namespaces; `tcp+udp` collides with either.
    pub fn overlaps(self, other: Protocol) -> bool {
        self.transports()
            .iter()
            .any(|t| other.transports().contains(t))
    }

    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        text.trim()
            .to_lowercase()
            .parse()
            .map_err(|_| ValidationError::InvalidProtocol(text.to_string()))
    }
}

/// An isolated internal network segment managed by natctl
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bridge {
    pub name: String,
    /// Canonical IPv4 network, e.g. `10.10.10.0/24`
    pub subnet: String,
    pub gateway_ip: String,
    #[serde(default)]
    pub nat_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<DhcpPool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forwards: Vec<PortForward>,
}

impl Bridge {
    pub fn new(name: impl Into<String>, subnet: impl Into<String>, gateway_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subnet: subnet.into(),
            gateway_ip: gateway_ip.into(),
            nat_enabled: false,
            dhcp: None,
            forwards: Vec::new(),
        }
    }

    /// Parsed subnet, `None` if the stored text is not a valid IPv4 CIDR
    pub fn network(&self) -> Option<Ipv4Network> {
        parse_cidr(&self.subnet).ok()
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.network()
            .is_some_and(|net| validators::contains_address(&net, address))
    }

    pub fn enabled_forwards(&self) -> impl Iterator<Item = &PortForward> {
        self.forwards.iter().filter(|f| f.enabled)
    }

    /// Checks the bridge-level invariants: interface name, subnet, gateway
    /// containment, the DHCP pool, and forward ports/addresses.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validators::validate_interface_name(&self.name)?;
        let net = parse_cidr(&self.subnet)?;
        let gateway = parse_ipv4(&self.gateway_ip)?;
        if !validators::contains_address(&net, gateway) {
            return Err(ValidationError::GatewayOutsideSubnet {
                gateway: self.gateway_ip.clone(),
                subnet: self.subnet.clone(),
            });
        }
        if let Some(pool) = &self.dhcp {
            pool.validate_for(&self.subnet, &self.gateway_ip)?;
        }
        for forward in &self.forwards {
            validators::validate_port("ext_port", forward.ext_port)?;
            validators::validate_port("int_port", forward.int_port)?;
            parse_ipv4(&forward.int_ip)?;
        }
        Ok(())
    }
}

/// A DHCP pool served on one bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DhcpPool {
    pub range_start: String,
    pub range_end: String,
    #[serde(default = "default_lease_time")]
    pub lease_time: String,
    #[serde(default)]
    pub dns1: String,
    #[serde(default)]
    pub dns2: String,
}

fn default_lease_time() -> String {
    DEFAULT_LEASE_TIME.to_string()
}

impl DhcpPool {
    /// Builds a pool from operator input, trimming fields and applying the
    /// default lease time when none is given.
    pub fn from_input(start: &str, end: &str, lease_time: &str, dns1: &str, dns2: &str) -> Self {
        let lease_time = lease_time.trim();
        Self {
            range_start: start.trim().to_string(),
            range_end: end.trim().to_string(),
            lease_time: if lease_time.is_empty() {
                default_lease_time()
            } else {
                lease_time.to_string()
            },
            dns1: dns1.trim().to_string(),
            dns2: dns2.trim().to_string(),
        }
    }

    /// Validates the whole pool against its bridge before it is accepted.
    /// A pool is either valid in every field or not stored at all.
    pub fn validate_for(&self, subnet: &str, gateway: &str) -> Result<(), ValidationError> {
        // Fields are written into dnsmasq.conf verbatim, one directive per line
        for (field, value) in [
            ("range_start", &self.range_start),
            ("range_end", &self.range_end),
            ("lease_time", &self.lease_time),
            ("dns1", &self.dns1),
            ("dns2", &self.dns2),
        ] {
            if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(ValidationError::Invalid {
                    field: field.into(),
                    message: format!("unexpected whitespace in {value:?}"),
                });
            }
        }
        validators::validate_range(subnet, gateway, &self.range_start, &self.range_end)
            .map_err(ValidationError::Range)?;
        validators::validate_optional_ipv4(&self.dns1).map_err(|_| ValidationError::Invalid {
            field: "dns1".into(),
            message: format!("invalid IPv4 address {:?}", self.dns1),
        })?;
        validators::validate_optional_ipv4(&self.dns2).map_err(|_| ValidationError::Invalid {
            field: "dns2".into(),
            message: format!("invalid IPv4 address {:?}", self.dns2),
        })?;
        validators::validate_lease_time(&self.lease_time)
    }

    /// Configured DNS servers, at most two, empty entries dropped
    pub fn dns_servers(&self) -> Vec<&str> {
        [self.dns1.as_str(), self.dns2.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// A destination-NAT rule from the WAN interface into a bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForward {
    pub id: String,
    pub protocol: Protocol,
    pub ext_port: u16,
    pub int_ip: String,
    pub int_port: u16,
    #[serde(default)]
    pub comment: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl PortForward {
    /// Generates a fresh opaque forward identifier
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// One active DHCP assignment as reported by the daemon's lease file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub timestamp: String,
    pub mac: String,
    pub ip: String,
    pub hostname: String,
}
