//! Reverse HTTP tunnel relay.
//!
//! Remote clients hold an outbound control connection to the relay and
//! are exposed under `{id}.{host}`. Public HTTP requests for that
//! subdomain are serialized, pushed through the control connection, and
//! the client's reply is relayed back to the caller.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod http_message;
pub mod registry;
pub mod server;
pub mod tls;
pub mod tunnel;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use client::{generate_id, ExchangeError, TunnelClient, TunnelHandle, TunnelSettings};
pub use config::Config;
pub use dispatch::Dispatcher;
pub use registry::ClientRegistry;
pub use server::{run_server, Relay};
pub use tunnel::{decode, encode, FrameDecoder, Message, ProxiedRequest, ProxiedResponse, ProxyKind};
