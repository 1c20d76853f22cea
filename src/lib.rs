#![warn(unused_crate_dependencies)]

//! QUIC game traffic proxy: terminates client connections,
//! authenticates them against the external session service, forwards
//! per-player traffic to backend game servers, and coordinates with
//! peer proxies over a shared pub/sub bus.

pub mod config;
pub mod ext;
pub mod listener;
pub mod proxy;
pub mod services;
pub mod session;
pub mod utils;
