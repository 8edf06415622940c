//! Egress policy: the runtime allowlist and blocked address ranges.
//!
//! The [`AllowListStore`] is created once by the server and handed to each
//! listener and to the control API as an `Arc`. Nothing looks it up globally.

pub mod allowlist;
pub mod cidr;
pub mod error;

pub use allowlist::{AllowListSnapshot, AllowListStore, DnsEntry, HostPattern, HttpEntry};
pub use cidr::{Cidr, CidrBlocker, DEFAULT_BLOCKED_CIDRS};
pub use error::{PolicyError, PolicyResult};
