//! # parley-server
//!
//! Real-time core of the parley messaging service: per-connection sessions
//! and their pumps, the connection registry, frame dispatch, private and
//! group delivery, offline sync, and the axum surface that hosts them.

pub mod auth;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod health;
pub mod membership;
pub mod pump;
pub mod registry;
pub mod server;
pub mod services;
pub mod session;
pub mod shutdown;
pub mod sweeper;
pub mod sync;

pub use errors::ChatError;
pub use registry::Registry;
pub use server::{start, ServerConfig, ServerHandle};
pub use services::{Backends, Services};
pub use session::{Session, SessionState};
