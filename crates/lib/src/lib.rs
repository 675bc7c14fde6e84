//! Client library for the unofficial Sense energy monitor API.
//!
//! Sense does not provide a supported API; this may stop working without notice.
//! The main entry points are [`Client`] for an authenticated account and
//! [`realtime::RealtimeClient`] for the realtime telemetry feed.

pub mod auth;
pub mod client;
pub mod config;
pub mod realtime;
mod wire;

pub use auth::{Monitor, PasswordCredentials};
pub use client::{Client, ClientError, ClientOptions};
pub use realtime::{Flow, Handler, Message};
