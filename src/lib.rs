//! natctl - declarative NAT bridges for virtualization hosts
//!
//! Keeps a small JSON model of internal bridges (subnet, gateway, NAT flag,
//! DHCP pool, port forwards) and reconciles it into an nftables table and a
//! dnsmasq instance.
//!
//! # Architecture
//!
//! - [`core`] - Model, compilers, reconcilers and the state container
//! - [`audit`] - JSON-lines audit log of every host-changing operation
//! - [`validators`] - Address, range and name validation
//! - [`config`] - Persisted model file and host paths
//! - [`utils`] - Atomic writes and digests
//!
//! # Guarantees
//!
//! - All input validated before the model changes
//! - Model persisted atomically before the host is touched
//! - Generated outputs are deterministic, so re-applying is a no-op
//! - Partial host failures reported per step, never hidden

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use config::{Config, HostPaths};
pub use core::error::{Error, Result};
pub use core::model::{Bridge, DhcpPool, PortForward, Protocol};
pub use core::report::{ApplyReport, StepOutcome};
pub use core::state::NetworkState;
