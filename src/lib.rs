//! ruletun - a rule-based network tunnel
//!
//! # Architecture
//!
//! ```text
//! Inbound (HTTP/SOCKS)
//! → Metadata
//! → Dispatcher (resolve → rules → group pick)
//! → Outbound (direct / reject / relay)
//! → Splice (tracked, cancellable)
//! ```
//!
//! ## Core Principles
//!
//! - Rule evaluation only reads Metadata, never sockets
//! - Rules, proxies and the resolver are immutable snapshots behind
//!   atomically swappable cells; a hot reload is one pointer store
//! - The tracker and log bus are explicit services threaded through the
//!   dispatcher and control plane, never globals; tests build their own
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Metadata, Address, Pipe
//! ├── transport/       # Raw TCP connect/bind
//! ├── inbound/         # HTTP and SOCKS accept shims
//! ├── outbound/        # Adapters, proxy groups, health probes
//! ├── dns/             # Resolver, TTL cache, fake-IP pool
//! ├── rules/           # Ordered first-match rule engine
//! ├── tunnel/          # Dispatcher and connection tracker
//! ├── api/             # REST + WebSocket control plane
//! └── app/             # Runtime assembly and hot reload
//! ```

// Core types
pub mod common;
pub mod error;

// Pipeline layers
pub mod dns;
pub mod inbound;
pub mod outbound;
pub mod rules;
pub mod transport;
pub mod tunnel;

// Services
pub mod api;
pub mod logbus;
pub mod metrics;

// Supporting modules
pub mod app;
pub mod config;
pub mod geoip;
pub mod platform;

// Re-exports for convenience
pub use common::{Address, InboundKind, Metadata, Network, Stream};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use app::{ReloadCoordinator, Runtime};
pub use dns::Resolver;
pub use outbound::{Outbound, ProxySet};
pub use rules::RuleEngine;
pub use tunnel::{Dispatcher, Tracker};
