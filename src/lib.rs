//! Connector runtime and network proxy core of the streamgate data plane.
//!
//! Two subsystems live here. The connector [`runtime`] launches containerized
//! connector processes, frames their stdout into typed records, and supervises
//! their lifecycle. The network side accepts user TLS at the [`frontend`],
//! resolves the target task shard from the [`sni`], and moves bytes to the
//! shard's container over the gRPC [`tunnel`], either as a raw [`bridge`] or
//! through the authorizing HTTP/2 [`gateway`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod frontend;
pub mod gateway;
pub mod registry;
pub mod runtime;
pub mod sni;
pub mod tunnel;

pub use error::{ProxyError, Result};
