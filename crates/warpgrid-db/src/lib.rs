//! warpgrid-db: guest-side SDK for the WarpGrid database proxy.
//!
//! Guests cannot open sockets. They reach databases through the host's
//! `DatabaseProxy` capability, and this crate makes that pleasant:
//! - **config**: `DbConfig` with friendly field names, validated before any host call
//! - **connection**: `Connection`, a handle wrapper with local close tracking
//! - **client**: `PgClient`, a thin text-mode Postgres client over a `Connection`
//! - **error**: `DbError`, the operation that failed plus its cause

pub mod client;
pub mod config;
pub mod connection;
pub mod error;

pub use client::{PgClient, QueryResult, Row};
pub use config::DbConfig;
pub use connection::Connection;
pub use error::{Cause, DbError, Operation, ServerError};
pub use warp_core::{DatabaseProxy, Protocol};
