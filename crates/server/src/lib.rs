//! REST surface and process wiring for Plinth.
//!
//! This crate is the thin glue around the engine: axum routes, login and
//! token verification, row-level access rules, rate limiting, the
//! server-sent-events realtime bridge, stats endpoints, and first-boot
//! superuser seeding. The engine trusts this layer: password hashing and
//! authorization never reach the core.

#![deny(unsafe_code)]

pub mod access;
pub mod app;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod realtime;
pub mod routes;
pub mod shutdown;
pub mod state;

pub use app::{App, build_app};
pub use config::Config;
pub use state::AppState;
