//! JIMM — the authenticating WebSocket proxy that sits between Juju clients and Juju
//! controllers.
//!
//! The proxy engine (dialer, RPC client, admin interceptor, permission retry, and the
//! bidirectional pump) is the core of this crate; see [`proxy::run_session`] for the entry
//! point a host application upgrades a client WebSocket into. Everything under
//! [`services`] is a trait boundary the host wires up to real collaborators (identity
//! provider, authorization engine, controller-record store); this crate only carries the
//! shapes, not the implementations.

#[macro_use]
extern crate tracing;

pub mod admin;
pub mod audit;
pub mod config;
pub mod dev_services;
pub mod dialer;
pub mod error;
pub mod http;
pub mod http_passthrough;
pub mod inflight;
pub mod listener;
pub mod message;
pub mod proxy;
pub mod retry;
pub mod rpc_client;
pub mod services;
pub mod stream_proxy;
pub mod tls;

pub use error::JimmError;
pub use proxy::{run_session, SessionDeps};
