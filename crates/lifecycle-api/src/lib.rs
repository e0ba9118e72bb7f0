//! Tenant Lifecycle Management API
//!
//! warp HTTP surface over the control plane. Every route requires an
//! operator bearer token (see [`auth`]).
//!
//! ```rust,ignore
//! let state = ApiState::new(system.control_plane.clone(), TokenVerifier::new(public_key));
//! let (addr, server) = bind(([127, 0, 0, 1], 8080).into(), state, shutdown_signal())?;
//! tokio::spawn(server);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod auth;
pub mod dto;
pub mod error;
mod handlers;
pub mod routes;

pub use auth::{issue_token, AuthError, OperatorClaims, TokenVerifier, OPERATOR_ROLE};
pub use error::{ApiError, ErrorBody};
pub use routes::routes;

use lifecycle_core::ControlPlane;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared handler state
#[derive(Debug, Clone)]
pub struct ApiState {
    pub control_plane: Arc<ControlPlane>,
    pub verifier: Arc<TokenVerifier>,
}

impl ApiState {
    /// Create state
    #[must_use]
    pub fn new(control_plane: Arc<ControlPlane>, verifier: TokenVerifier) -> Self {
        Self {
            control_plane,
            verifier: Arc::new(verifier),
        }
    }
}

/// Bind the API to `addr`; the returned future serves until `shutdown` resolves
pub fn bind(
    addr: SocketAddr,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
    let (bound, server) =
        warp::serve(routes(state)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    tracing::info!(addr = %bound, "management API listening");
    Ok((bound, server))
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
