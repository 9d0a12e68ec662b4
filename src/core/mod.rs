//! Core reconciliation engine
//!
//! This module contains the declarative network model and the logic that
//! projects it onto the host. It provides:
//!
//! - [`model`]: Bridges, DHCP pools and port forwards
//! - [`nat`]: nftables NAT compiler and reconciler
//! - [`dhcp`]: dnsmasq config compiler and reconciler
//! - [`state`]: The serialized mutate, persist, reconcile container
//! - [`inventory`]: Host and guest inventory seam
//! - [`usage`]: Derived IP-usage views
//! - [`error`]: Error types and diagnostic hints

pub mod dhcp;
pub mod error;
pub mod inventory;
pub mod model;
pub mod nat;
pub mod report;
pub mod state;
pub mod tool;
pub mod usage;

#[cfg(test)]
pub mod test_helpers;
