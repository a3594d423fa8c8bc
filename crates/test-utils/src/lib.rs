//! Test utilities shared across Plinth crates.

#![deny(unsafe_code)]

pub mod fixtures;
pub mod strategies;

pub use fixtures::{posts_schema, record};
