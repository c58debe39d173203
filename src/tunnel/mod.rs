//! Byte tunnel between the frontend and shard containers, over a
//! bidirectional gRPC stream.

pub mod client;
pub mod proto;
pub mod server;

pub use client::{DialStatus, TunnelAbort, TunnelConn, TunnelDialer};
pub use server::{TunnelBackend, CONNECTOR_INIT_PORT};
