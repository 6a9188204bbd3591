//! sdtun: socket over DNS tunnel client
//!
//! Carries an arbitrary bidirectional byte stream across a DNS resolution
//! channel, for networks where only DNS queries reach the outside. The
//! local end owns stdin/stdout or one bridged TCP connection; the far end
//! is a cooperating DNS server that accepts uplink queries and answers
//! polling queries with downlink payload.
//!
//! ## Quick Start
//!
//! ```bash
//! # Tunnel stdin/stdout through the tunnel domain
//! sdtun -r 127.0.0.1 sshdns.a.example.com
//!
//! # Bridge a local TCP port instead of stdio and forward dynamically
//! sdtun -p 2022 -D internal-host:22 sshdns.a.example.com
//! ```
//!
//! ## Architecture
//!
//! ```text
//!             ┌────────────────┐ escalate  ┌──────────────────┐
//! stdin  ───▶ │  Uplink Worker │ ────────▶ │  Downlink Worker │ ───▶ stdout
//! (or TCP)    │  read + send   │           │  poll + backoff  │   (or TCP)
//!             └───────┬────────┘           └────────┬─────────┘
//!                     │        DNS Codec            │
//!                     ▼      (base32 labels)        ▼
//!               A queries  ──▶ nameserver ◀──  TXT/CNAME/NULL polls
//! ```
//!
//! The two workers never share mutable state; they coordinate through a
//! lossy one-slot escalation channel and a shutdown flag, and the session
//! supervisor guarantees neither outlives the other.

pub mod codec;
pub mod config;
pub mod downlink;
pub mod forward;
pub mod proxy;
pub mod resolver;
pub mod session;
pub mod strategy;
pub mod uplink;
pub mod wire;

// Re-export core types
pub use codec::{DnsCodec, TransportCodec};
pub use config::{DomainStrategy, ForwardMode, RecordType, SessionConfig};
pub use downlink::{DownlinkOutcome, DownlinkWorker};
pub use forward::parse_forward;
pub use proxy::ProxyBridge;
pub use resolver::{QueryStrategy, ResolverDriver, ResolverOpts};
pub use strategy::DomainPicker;
pub use uplink::UplinkWorker;

/// Tunnel error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// DNS message could not be built or parsed
    #[error("wire format error: {0}")]
    Wire(#[from] wire::WireError),

    /// Nameserver selection or setup error
    #[error("resolver error: {0}")]
    Resolver(String),

    /// A lookup ran out of time
    #[error("lookup timed out")]
    Timeout,

    /// The far end refused a delivery
    #[error("delivery rejected: rcode {0}")]
    Rejected(u8),

    /// A response arrived but made no sense
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The dynamic forward target could not be resolved
    #[error("cannot resolve forward target: {0}")]
    ForwardResolve(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
