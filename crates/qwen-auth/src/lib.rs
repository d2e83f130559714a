//! Qwen OAuth device-flow library
//!
//! Provides PKCE generation, the RFC 8628 device authorization grant wire
//! calls, token refresh, and the in-memory coordinator that drives a pending
//! device flow from initiation to an issued token. This crate is a standalone
//! library with no dependency on the proxy binary, so it can be tested and
//! used independently.
//!
//! Acquisition flow:
//! 1. Admin calls `OAuthCoordinator::init()`: a PKCE pair is generated and the
//!    device-code endpoint returns a user code + verification URI
//! 2. The admin UI polls `OAuthCoordinator::poll()` while the user authorizes
//!    in a browser
//! 3. On grant, the coordinator returns a `TokenData` ready for the pool
//! 4. The pool keeps the token live via `refresh_grant()`

pub mod constants;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod pkce;
pub mod token;

pub use constants::OAuthConfig;
pub use coordinator::{DeviceFlowStarted, OAuthCoordinator, PollReply};
pub use error::{Error, Result};
pub use pkce::{compute_challenge, generate_verifier, new_state_id, token_id_for};
pub use token::{TokenData, TokenGrant, refresh_grant};
