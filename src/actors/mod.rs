//! Actor-based monitoring engine
//!
//! Each actor runs as an independent async task communicating via Tokio
//! channels.
//!
//! ```text
//!   udp readers ──mpsc (bounded)──> dispatcher workers ──commands──┐
//!                                                                  ▼
//!   timer ─────────────────────────────────────> HostMonitorManager
//!                                                        │
//!                                              host pool + driver registry
//! ```
//!
//! ## Communication patterns
//!
//! 1. **Commands**: the manager has an mpsc command channel for control messages
//! 2. **Request/Response**: oneshot channels for synchronous queries
//! 3. The dispatcher queue is bounded; the listener drops on saturation

pub mod dispatcher;
pub mod manager;
pub mod messages;
