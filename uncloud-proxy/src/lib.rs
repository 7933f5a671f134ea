//! Fan-out RPC proxy.
//!
//! Accepts a call on any machine and dispatches it to the local backend, one
//! remote peer, or many peers in parallel, stamping each reply envelope with
//! the identity of the machine that produced it.
//!
//! - [`backend`]: local (Unix socket) and remote (overlay TCP) backends
//! - [`director`]: request classification and backend lookup
//! - [`dispatch`]: One2One/One2Many execution and envelope stamping
//! - [`service`]: proxy-side gRPC services
//! - [`server`]: serving the proxy on a Unix socket and the overlay

pub mod backend;
pub mod director;
pub mod dispatch;
pub mod error;
pub mod server;
pub mod service;

pub use backend::{Backend, LocalBackend, RemoteBackend};
pub use director::{Director, Mode, RoutedCall};
pub use error::ProxyError;
pub use server::ProxyServer;
