//! Host-side control channel.
//!
//! - [`ControlApi`]: HTTPS listener requiring client certificates
//! - [`ControlClient`]: the matching client used by the CLI
//!
//! The API is the only way to change the allowlist after startup.

pub mod api;
pub mod client;
mod error;

pub use api::{AllowRequest, AllowResponse, ConfigView, ControlApi, ControlState, handle_control};
pub use client::ControlClient;
pub use error::{ControlError, ControlResult};
