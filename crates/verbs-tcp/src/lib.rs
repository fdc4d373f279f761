//! Datapath of a message-oriented transport built on TCP stream sockets,
//! emulating send/recv plus zero-copy read/write verbs semantics over a
//! plain byte stream.
//!
//! See `connection::Connection` for the per-socket state machine and
//! `connector::TcpConnector` for the `mio` event loop that drives it.

pub mod connection;
pub mod connector;
pub mod error;
pub mod flags;
pub mod header;
pub mod inbound;
pub mod mbuf;
pub mod mempool;
pub mod observer;
pub mod options;
pub mod outbound;
pub mod setup;
pub mod sge;
pub mod task;
pub mod telemetry;
pub mod tlv;
pub mod work;

pub use connection::{Connection, ConnState};
pub use error::{DatapathError, Result};
pub use observer::Observer;
pub use options::{ConnTunables, TcpOptions};
pub use telemetry::{NoTelemetry, Telemetry};
