//! Vultr provider plugin
//!
//! Manages Vultr Kubernetes Engine clusters through the JSON-RPC plugin
//! protocol. Cluster creation blocks on [`poller::converge`] until the remote
//! cluster reports `active`.

pub mod cancel;
pub mod client;
pub mod poller;
pub mod provider;
pub mod resources;
pub mod schema;
