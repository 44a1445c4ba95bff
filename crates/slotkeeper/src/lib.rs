//! # Slotkeeper
//!
//! Arbitrates one sandboxed terminal session among many visitors.
//!
//! Visitors connect over WebSocket and ask to join a waitlist, optionally
//! presenting an invite. The head of the queue is promoted into the single
//! session slot; a container is started for them with the enabled
//! platforms' credentials, and the session ends on timeout, container
//! exit, or the owner leaving. An owner whose connection drops has a short
//! grace period to come back from the same address.
//!
//! This crate is the server: it wires the WebSocket transport and the HTTP
//! API to the [`Orchestrator`](slotkeeper_orchestrator::Orchestrator), and
//! loads [`Config`] from TOML.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use slotkeeper::prelude::*;
//!
//! # async fn start() -> Result<(), SlotkeeperError> {
//! let config = Config::default();
//! let backend = Production::backend(&config).await?;
//! let server = SlotkeeperServerBuilder::new()
//!     .config(config)
//!     .build::<Production>(backend)
//!     .await?;
//! server.run().await
//! # }
//! ```

#![allow(async_fn_in_trait)]

mod backend;
mod config;
mod error;
mod handler;
pub mod http;
mod server;

pub use backend::{AnyStore, Production};
pub use config::{
    Config, ContainerSection, QueueConfig, RateLimitSection, ServerConfig, SessionConfig,
    StoreConfig,
};
pub use error::SlotkeeperError;
pub use handler::CLOSE_IDLE;
pub use server::{CLOSE_RATE_LIMITED, SlotkeeperServer, SlotkeeperServerBuilder};

/// Re-exports for embedding the server.
pub mod prelude {
    pub use crate::{
        AnyStore, Config, Production, SlotkeeperError, SlotkeeperServer, SlotkeeperServerBuilder,
    };
    pub use slotkeeper_orchestrator::{
        Backend, Orchestrator, OrchestratorConfig, SessionBackend,
    };
    pub use slotkeeper_protocol::{ClientMessage, ServerMessage};
}
