//! PageRelay server: HTTP API for callers and a WebSocket endpoint for workers.

pub mod config;
pub mod error;
pub mod materializer;
pub mod rest;
pub mod server;
pub mod state;
pub mod transport;

pub use config::{resolve_addr, resolve_data_dir};
pub use error::ApiError;
pub use materializer::HttpMaterializer;
pub use rest::router;
pub use server::{serve, serve_with_shutdown};
pub use state::AppState;
