//! Request authentication
//!
//! Every request is turned into a [`SessionContext`](crate::domain::SessionContext)
//! before it reaches a handler.
//!
//! - **Bearer JWT**: HMAC-signed tokens carrying the actor id, role and an
//!   optional anonymous checkout session.
//! - **Anonymous checkout**: requests without credentials but with an
//!   `x-session-id` header act as that anonymous session.
//! - **Header mode**: with `AUTH_MODE=disabled`, `x-actor-id` and
//!   `x-actor-role` declare the actor directly. Development only.

mod jwt;
mod middleware;

pub use jwt::*;
pub use middleware::*;

/// Authentication error
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication")]
    MissingAuth,

    #[error("invalid JWT: {0}")]
    InvalidJwt(String),

    #[error("token expired")]
    TokenExpired,

    #[error("invalid session header: {0}")]
    InvalidHeader(String),
}
