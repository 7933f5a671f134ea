//! Overlay network control plane.
//!
//! - [`peer`]: per-peer liveness tracking and endpoint rotation policy
//! - [`device`]: tunnel device abstraction; the seam between reconciliation
//!   logic and the kernel
//! - [`network`]: the mesh driver (apply-style configure) and the control
//!   loop that probes liveness and rotates endpoints
//! - [`linux`]: kernel-backed device via netlink (Linux only)

pub mod device;
pub mod error;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod network;
pub mod peer;

pub use device::{DeviceConfig, DevicePeer, DeviceState, PeerPatch, WgDevice};
pub use error::WgError;
pub use network::{Config, EndpointChangeEvent, PeerSnapshot, WgNetwork};
pub use peer::{PeerConfig, PeerStatus, REJECTED_THRESHOLD, ROTATE_INTERVAL, UP_THRESHOLD};

/// Tunnel interface name shared by every cluster machine.
pub const INTERFACE_NAME: &str = "uncloud0";
