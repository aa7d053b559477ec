//! HTTP/WebSocket control surface for the engine.

pub mod routes;

pub use routes::{AppState, api_routes};
