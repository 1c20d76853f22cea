//! Cross-proxy coordination: peer registry, heartbeats and the
//! replicated server list. Everything here rides on the messaging
//! service; when that runs in loopback mode these components keep
//! working against local data only.

pub mod heartbeat;
pub mod registry;
pub mod server_list;
