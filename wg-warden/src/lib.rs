// WireGuard peer warden library
// Shared modules for the daemon, the console client and tests

//! WireGuard peer warden
//!
//! This library gates WireGuard/AmneziaWG peers by time and by traffic. Peers
//! live in `# BEGIN_PEER`/`# END_PEER` blocks of the daemon configuration
//! file; blocking a peer comments its block out and resyncs the running
//! interface without disturbing other sessions.
//!
//! # Main Components
//!
//! - [`peer_config`]: peer block edits and daemon resync
//! - [`daemon`]: `wg`/`awg` control-plane adapter
//! - [`counters`]: per-peer transfer totals from the daemon
//! - [`quota`]: persistent traffic quotas and the reconciliation algorithm
//! - [`expiry`]: persistent expiry instants
//! - [`engine`]: lifecycle engine tying the above together
//! - [`control`]: operator control socket
//! - [`codec`]: `vpn://` config link encoding

pub mod codec;
pub mod config;
pub mod control;
pub mod counters;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod locks;
pub mod peer_config;
pub mod quota;
pub mod state_file;
pub mod timers;
pub mod types;
