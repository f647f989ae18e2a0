//! HTTP and WebSocket surface for Conductor.
//!
//! Exposes task submission, agent-to-agent delegation, communication and
//! negotiation over JSON HTTP, and streams every lifecycle event from the
//! [`EventBus`](conductor_core::EventBus) to WebSocket clients.
//!
//! # Main types
//!
//! - [`GatewayServer`] — Builds the axum [`Router`](axum::Router).
//! - [`AuthConfig`] — Optional API-key authentication.
//! - [`ApiError`] — Maps [`ConductorError`](conductor_core::ConductorError) kinds to HTTP statuses.

/// WebSocket connection tracking.
pub mod connection;
/// Error to response mapping.
pub mod error;
/// HTTP route handlers.
pub mod handlers;
/// API-key authentication.
pub mod middleware;
/// Router assembly and shared state.
pub mod server;
/// WebSocket endpoint.
pub mod ws;

pub use connection::{ConnectionManager, ConnectionSink};
pub use error::ApiError;
pub use middleware::AuthConfig;
pub use server::{AppState, GatewayServer};
pub use ws::ClientMessage;
