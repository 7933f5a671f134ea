//! Shared domain types for the Uncloud cluster core.
//!
//! - [`types`]: strong newtypes (public keys, machine identifiers)
//! - [`keypair`]: Curve25519 tunnel keypair with key-file persistence
//! - [`network`]: per-machine overlay network configuration and subnet math
//! - [`machine`]: machine records and membership states

pub mod keypair;
pub mod machine;
pub mod network;
pub mod types;

pub use keypair::KeyPair;
pub use machine::{MachineInfo, MembershipState};
pub use network::{allocate_subnet, management_ip, NetworkConfig, NetworkError, WG_PORT};
pub use types::{MachineId, PublicKey};
