//! warpgrid-host: host side of the WarpGrid database proxy.
//!
//! Guests never open sockets themselves. They call the four-operation
//! `DatabaseProxy` capability, and this crate services those calls:
//! - **db_proxy**: per-key connection pools, the handle registry, and the
//!   Postgres, MySQL and Redis backends with their liveness probes
//! - **config**: ShimConfig built from the `[database_proxy]` table of `warp.toml`

pub mod config;
pub mod db_proxy;
