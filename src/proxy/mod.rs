//! Proxy Module
//!
//! Per-peer protocol state and the registry that owns it.

mod manager;
mod peer;

pub use manager::{FailureSender, Inbox, InboxSender, ProxyManager};
pub use peer::{Proxy, ReceiveOutcome};
