//! Relays trigger events into timed avatar state changes on veadotube.
//!
//! The [`connection::VeadotubeConnection`] owns the control socket; callers
//! feed it [`model::StateEvent`]s through `enqueue` and it applies them one
//! at a time, in order.

pub mod bindings;
pub mod config;
pub mod connection;
pub mod model;
pub mod protocol;
pub mod state_map;
pub mod transport;
