//! Serial access and idempotency for volume RPC services.
//!
//! The crate interposes on a volume-management service and enforces two
//! guarantees on the state-mutating RPCs: at most one in-flight operation
//! holds a given volume, and a repeated request whose end state has already
//! been reached is answered from observable state instead of reaching the
//! service again. See [`IdempotencyLayer`] for the entry point.

/// Layer tunables.
pub mod config;
/// Message types for the volume RPC surface.
pub mod csi;
/// Endpoint and CLI value parsing helpers.
pub mod endpoint;
/// Transport-level errors.
pub mod error;
/// The interception layer.
pub mod interceptor;
mod locks;
/// In-memory volume service for tests and the wrapper binary.
pub mod mock;
/// The state oracle and downstream service boundaries.
pub mod provider;
/// Bounded-wait mutual exclusion.
pub mod trylock;

pub use config::IdempotencyOptions;
pub use error::SvcError;
pub use interceptor::IdempotencyLayer;
pub use provider::{IdempotencyProvider, VolumeHandler};
