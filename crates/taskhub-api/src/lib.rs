//! HTTP surface and DTOs for TaskHub's control plane. Split into a library
//! so the axum router can be exercised directly in tests without binding a
//! socket; `main.rs` is the thin binary wiring this to the four CLI
//! subcommands.

pub mod dto;
pub mod error;
pub mod http;

pub use http::{router, AppState};
