#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_extern_crates
)]

//! # Gateway process entry point
//!
//! Wires the subsystem crates (`gateway-auth`, `gateway-bus`,
//! `gateway-markets`, `gateway-stream`, `gateway-execution`, `gateway-risk`,
//! `gateway-core`) to the one concrete broker transport this binary ships
//! with: [`http::HttpBroker`] over `reqwest` for login/REST, and
//! `gateway_stream::{WsMarketTransport, WsUserTransport}` for the two
//! streaming hubs.

pub mod config;
pub mod http;

pub use config::{from_env, ConfigError};
pub use http::HttpBroker;
