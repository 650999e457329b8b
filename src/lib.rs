//! afscache - a caching file proxy that sits between clients and an
//! authoritative origin file server, caching whole files on local disk under
//! check-on-open consistency: a cached copy is validated against the origin
//! once, at `open`, and frozen for the lifetime of that handle.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod rpc;
pub mod session;
pub mod wire;

pub use dispatcher::serve;
