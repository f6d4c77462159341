//! Deep Pivots API Library Crate
//!
//! The HTTP side of the voice coach: it issues short-lived Hume EVI session
//! tokens to the browser so that long-lived credentials never leave the
//! server. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
