//! # rdx-server: Display Server
//!
//! Serves adaptive screen updates to remote viewers. Each viewer gets its
//! own `ServerSession` from `rdx-core`, fed by a synthetic moving-box
//! capture source until a real windowing backend is plugged in.
//!
//! ## Modules
//!
//! - **config**: TOML configuration and conversion to session settings.
//! - **pattern**: the synthetic capture source.
//! - **service**: the accept loop and per-viewer session driver.

pub mod config;
pub mod pattern;
pub mod service;
