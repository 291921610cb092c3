//! hackload load-test orchestrator library.
//!
//! This crate primarily ships an `orchestrator` binary, but we expose a
//! small library surface to enable integration testing and reuse.

pub mod api;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod db;
pub mod k6;
pub mod locks;
pub mod model;
pub mod state;
pub mod sync;
pub mod testing;
