//! # Virtumancer Server
//!
//! The host/VM control plane: pooled hypervisor connections, a persistent
//! inventory cache kept converged by reconciliation, reference-counted
//! statistics fan-out to WebSocket subscribers, and opaque VNC/SPICE
//! console relays.

pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod http;
pub mod pool;
pub mod reconciler;
pub mod server;
pub mod service;
pub mod session;
pub mod subscriptions;
pub mod tls;

pub use error::ControlError;
pub use events::{Event, EventBus};
pub use pool::ConnectionPool;
pub use reconciler::Reconciler;
pub use service::{AddHostRequest, ControlPlaneService};
pub use subscriptions::SubscriptionManager;
