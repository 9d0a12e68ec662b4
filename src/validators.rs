//! Input validation and address arithmetic for natctl
//!
//! Every check here is a pure function: identical inputs always yield the
//! same verdict. The same functions back forward creation, DHCP pool edits
//! and model validation on load, so a value accepted by one path is accepted
//! by all of them.

use crate::core::error::{RangeError, ValidationError};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Maximum length of a Linux interface name (IFNAMSIZ - 1)
pub const MAX_INTERFACE_LEN: usize = 15;

/// Maximum comment length carried into the ruleset
pub const MAX_COMMENT_LEN: usize = 64;

/// Parses an IPv4 CIDR such as `10.10.10.0/24` or `10.10.10.1/24`.
///
/// IPv6 networks and malformed masks are rejected. Host bits are kept; use
/// [`canonical_subnet`] to clear them.
///
/// # Examples
///
/// ```
/// use natctl::validators::parse_cidr;
///
/// assert!(parse_cidr("10.10.10.0/24").is_ok());
/// assert!(parse_cidr("fd00::/64").is_err());
/// assert!(parse_cidr("10.10.10.0/33").is_err());
/// ```
pub fn parse_cidr(text: &str) -> Result<Ipv4Network, ValidationError> {
    let text = text.trim();
    // A bare address would otherwise parse as a /32
    if !text.contains('/') {
        return Err(ValidationError::InvalidCidr(text.to_string()));
    }
    text.parse::<Ipv4Network>()
        .map_err(|_| ValidationError::InvalidCidr(text.to_string()))
}

/// Parses a dotted-quad IPv4 address.
pub fn parse_ipv4(text: &str) -> Result<Ipv4Addr, ValidationError> {
    text.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| ValidationError::InvalidAddress(text.to_string()))
}

/// Whether `address` falls inside `network`, network and broadcast included.
pub fn contains_address(network: &Ipv4Network, address: Ipv4Addr) -> bool {
    network.contains(address)
}

/// Unsigned 32-bit ordering of two addresses.
pub fn address_le(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    u32::from(a) <= u32::from(b)
}

/// Returns the network in canonical form, host bits cleared.
///
/// ```
/// use natctl::validators::canonical_subnet;
///
/// assert_eq!(canonical_subnet("10.10.10.1/24").unwrap(), "10.10.10.0/24");
/// ```
pub fn canonical_subnet(text: &str) -> Result<String, ValidationError> {
    let net = parse_cidr(text)?;
    Ok(format!("{}/{}", net.network(), net.prefix()))
}

/// Builds the `gateway/prefix` form used when assigning an address to a new
/// bridge interface. The gateway must lie inside the subnet.
pub fn cidr_from_subnet_and_gateway(subnet: &str, gateway: &str) -> Result<String, ValidationError> {
    let net = parse_cidr(subnet)?;
    let gw = parse_ipv4(gateway)?;
    if !contains_address(&net, gw) {
        return Err(ValidationError::GatewayOutsideSubnet {
            gateway: gw.to_string(),
            subnet: subnet.trim().to_string(),
        });
    }
    Ok(format!("{gw}/{}", net.prefix()))
}

/// Converts a dotted netmask to its prefix length.
///
/// Non-contiguous masks and `0.0.0.0` are rejected.
pub fn netmask_to_prefix(mask: &str) -> Result<u8, ValidationError> {
    let addr = parse_ipv4(mask).map_err(|_| ValidationError::InvalidNetmask(mask.to_string()))?;
    let bits = u32::from(addr);
    let ones = bits.leading_ones();
    if ones == 0 || bits.checked_shl(ones).unwrap_or(0) != 0 {
        return Err(ValidationError::InvalidNetmask(mask.to_string()));
    }
    // leading_ones() is at most 32
    Ok(u8::try_from(ones).unwrap_or(32))
}

/// Converts a prefix length (1-32) to a dotted netmask.
pub fn prefix_to_netmask(prefix: u8) -> Result<Ipv4Addr, ValidationError> {
    if prefix == 0 || prefix > 32 {
        return Err(ValidationError::InvalidNetmask(format!("/{prefix}")));
    }
    let bits = u32::MAX << (32 - u32::from(prefix));
    Ok(Ipv4Addr::from(bits))
}

/// Builds `address/prefix` from an interface's address and dotted netmask.
pub fn cidr_from_addr_netmask(address: &str, netmask: &str) -> Result<String, ValidationError> {
    let ip = parse_ipv4(address)?;
    let prefix = netmask_to_prefix(netmask)?;
    Ok(format!("{ip}/{prefix}"))
}

/// Validates a DHCP range (or any start/end pair) against a bridge.
///
/// Checks, in order, short-circuiting on the first failure:
/// 1. the subnet parses as IPv4 CIDR
/// 2. start and end parse as IPv4 addresses
/// 3. both lie inside the subnet
/// 4. start <= end
/// 5. the gateway does not lie in `[start, end]`
///
/// A gateway that does not parse skips step 5; the model validator rejects
/// such gateways separately.
///
/// # Examples
///
/// ```
/// use natctl::validators::validate_range;
/// use natctl::core::error::RangeError;
///
/// assert!(validate_range("10.10.10.0/24", "10.10.10.1", "10.10.10.100", "10.10.10.200").is_ok());
/// assert_eq!(
///     validate_range("10.10.10.0/24", "10.10.10.1", "10.10.10.1", "10.10.10.50"),
///     Err(RangeError::RangeIncludesGateway),
/// );
/// ```
pub fn validate_range(subnet: &str, gateway: &str, start: &str, end: &str) -> Result<(), RangeError> {
    let net = parse_cidr(subnet).map_err(|_| RangeError::SubnetInvalid)?;
    let start = parse_ipv4(start).map_err(|_| RangeError::AddressInvalid)?;
    let end = parse_ipv4(end).map_err(|_| RangeError::AddressInvalid)?;

    if !contains_address(&net, start) || !contains_address(&net, end) {
        return Err(RangeError::RangeOutsideSubnet);
    }
    if !address_le(start, end) {
        return Err(RangeError::RangeInverted);
    }
    if let Ok(gw) = parse_ipv4(gateway)
        && address_le(start, gw)
        && address_le(gw, end)
    {
        return Err(RangeError::RangeIncludesGateway);
    }
    Ok(())
}

/// Validates a bridge/interface identifier.
///
/// Accepted: a letter, then 1-20 letters, digits or underscores, optionally
/// followed by a `.N` VLAN or `:N` alias suffix, at most 15 bytes in total.
/// Dashes are rejected because the virtualization platform rejects them in
/// bridge names.
pub fn validate_interface_name(name: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidInterfaceName(name.to_string());

    if name.is_empty() || name.len() > MAX_INTERFACE_LEN {
        return Err(invalid());
    }

    let (base, suffix) = match name.find(['.', ':']) {
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
        None => (name, None),
    };

    let mut chars = base.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(invalid());
    }
    let rest = chars.as_str();
    if rest.is_empty() || rest.len() > 20 {
        return Err(invalid());
    }
    if !rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid());
    }

    if let Some(suffix) = suffix
        && (suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(invalid());
    }

    Ok(())
}

/// Validates a host interface name such as the WAN uplink.
///
/// Looser than [`validate_interface_name`]: any name the kernel accepts is
/// allowed, i.e. alphanumerics plus `.`, `-`, `_`, at most 15 bytes.
pub fn validate_host_interface(name: &str) -> Result<(), ValidationError> {
    if name.is_empty()
        || name.len() > MAX_INTERFACE_LEN
        || name == "."
        || name == ".."
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(ValidationError::InvalidInterfaceName(name.to_string()));
    }
    Ok(())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(field: &'static str, port: u16) -> Result<u16, ValidationError> {
    if port == 0 {
        Err(ValidationError::InvalidPort { field })
    } else {
        Ok(port)
    }
}

/// Validates a dnsmasq lease duration: `infinite`, or digits with an
/// optional `s`/`m`/`h`/`d`/`w` unit.
pub fn validate_lease_time(lease: &str) -> Result<(), ValidationError> {
    if lease == "infinite" {
        return Ok(());
    }
    let digits = lease.trim_end_matches(['s', 'm', 'h', 'd', 'w']);
    let unit_len = lease.len() - digits.len();
    if digits.is_empty() || unit_len > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidLeaseTime(lease.to_string()));
    }
    Ok(())
}

/// Validates an optional DNS server field; empty means unset.
pub fn validate_optional_ipv4(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Ok(());
    }
    parse_ipv4(value).map(|_| ())
}

/// Sanitizes a forward comment for safe use in nftables `comment "..."`.
///
/// Removes control characters, quotes and backslashes, limits the result to
/// [`MAX_COMMENT_LEN`] bytes on a character boundary.
///
/// ```
/// use natctl::validators::sanitize_comment;
///
/// assert_eq!(sanitize_comment("ssh \"jump\"\n"), "ssh jump");
/// ```
pub fn sanitize_comment(input: &str) -> String {
    let mut out = String::new();
    for c in input.chars() {
        if c.is_control() || matches!(c, '"' | '\'' | '\\' | '`') {
            continue;
        }
        if out.len() + c.len_utf8() > MAX_COMMENT_LEN {
            break;
        }
        out.push(c);
    }
    out.trim().to_string()
}
