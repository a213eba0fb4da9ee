//! pqlan Node Runtime
//!
//! Async driver for the sans-IO protocol core. Runs one tokio task per peer
//! connection and exposes a cloneable [`Node`] handle to the application.
//!
//! # Architecture
//!
//! ```text
//! TcpStream ─> FramedTransport ─> peer task ─┬─ Handshake (deadline-bounded)
//!                                            └─ Session (select! loop)
//!                                                   │
//!                     Node handle ──PeerCommand──>──┘
//!                         │
//!                         └── NodeEvent channel ──> application
//! ```
//!
//! # Components
//!
//! - [`Node`]: connection management, application and group API
//! - [`Transport`] / [`FramedTransport`]: length-prefixed message framing
//! - [`SystemEnv`]: production time and randomness
//! - [`NodeError`]: driver-level errors wrapping the core taxonomy

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod node;
mod peer;
mod system_env;
mod transport;

pub use error::NodeError;
pub use node::{Node, NodeConfig, NodeEvent};
pub use system_env::SystemEnv;
pub use transport::{DEFAULT_MAX_FRAME_LEN, FramedTransport, Transport};

/// Trust database file inside a node's data directory.
pub const TRUST_DB_FILE: &str = "trust.redb";
