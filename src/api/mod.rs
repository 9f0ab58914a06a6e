//! HTTP API
//!
//! JSON surface over the session coordinator, plus oracle and game-result
//! intake for operators.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use handlers::AppState;
pub use server::ApiServer;
