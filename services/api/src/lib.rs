//! Personaverse API Library Crate
//!
//! This library contains the web service around `personaverse-core`: the
//! application state, configuration, REST handlers, WebSocket sessions and
//! routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
