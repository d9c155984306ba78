//! API server for Cyclone.
//!
//! Provides the HTTP REST API for cloud administration and the event lifecycle.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
