//! warp-core: the contract shared by the database proxy host and its guests.
//!
//! - **types**: `Protocol`, `ConnectConfig` and its pre-I/O validation
//! - **error**: `DbProxyError` and the wire-level `ErrorKind` names
//! - **proxy**: the four-operation `DatabaseProxy` capability trait
//! - **config**: `warp.toml` parsing for the `[database_proxy]` table

pub mod config;
pub mod error;
pub mod proxy;
pub mod types;

pub use config::{DatabaseProxyConfig, WarpConfig};
pub use error::{DbProxyError, ErrorKind};
pub use proxy::DatabaseProxy;
pub use types::*;
