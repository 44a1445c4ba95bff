//! `SlotkeeperServer` builder and server loop.
//!
//! This is the entry point for running a slotkeeper server. It ties the
//! layers together: transport → protocol → orchestrator, plus the HTTP API
//! on its own listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use slotkeeper_orchestrator::{Backend, Orchestrator, SessionBackend};
use slotkeeper_protocol::{Codec, JsonCodec};
use slotkeeper_transport::{Connection, Incoming, IncomingWebSocket, Transport, WebSocketTransport};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::handler::handle_connection;
use crate::http::{self, CookieSettings, HttpSettings};
use crate::{Config, SlotkeeperError};

/// Close code sent to a connection refused by the connection limiter.
pub const CLOSE_RATE_LIMITED: u16 = 4029;

/// How often expired rate-limit buckets are swept.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<B: SessionBackend, C: Codec> {
    pub(crate) orchestrator: Orchestrator<B>,
    pub(crate) codec: C,
    pub(crate) idle_timeout: Duration,
}

/// Builder for configuring and starting a slotkeeper server.
///
/// # Example
///
/// ```rust,ignore
/// use slotkeeper::prelude::*;
///
/// let config = Config::load("slotkeeper.toml")?;
/// let backend = Production::backend(&config).await?;
/// let server = SlotkeeperServerBuilder::new()
///     .config(config)
///     .bind("0.0.0.0:8080")
///     .build::<Production>(backend)
///     .await?;
/// server.run().await
/// ```
pub struct SlotkeeperServerBuilder {
    config: Config,
}

impl SlotkeeperServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Replaces the whole configuration. Call before `bind`/`http_bind`.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the WebSocket listen address.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.server.ws_bind = addr.to_string();
        self
    }

    /// Sets the HTTP API listen address.
    pub fn http_bind(mut self, addr: &str) -> Self {
        self.config.server.http_bind = addr.to_string();
        self
    }

    /// Binds both listeners and starts the orchestrator.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    ///
    /// # Errors
    /// Fails on an inconsistent configuration or if either address can't
    /// be bound.
    pub async fn build<B: SessionBackend>(
        self,
        backend: Backend<B>,
    ) -> Result<SlotkeeperServer<B, JsonCodec>, SlotkeeperError> {
        let orchestrator_config = self.config.orchestrator()?;
        let server = &self.config.server;

        let forwarded = self.config.forwarded_headers();
        let transport = WebSocketTransport::bind(&server.ws_bind)
            .await?
            .with_handshake_timeout(self.config.handshake_timeout())
            .with_forwarded_headers(forwarded);
        let http = TcpListener::bind(&server.http_bind).await?;

        let state = Arc::new(ServerState {
            orchestrator: Orchestrator::new(orchestrator_config, backend),
            codec: JsonCodec,
            idle_timeout: self.config.idle_timeout(),
        });
        let http_settings = HttpSettings {
            cookie: CookieSettings {
                name: server.cookie_name.clone(),
                secure: server.cookie_secure,
            },
            forwarded,
        };

        Ok(SlotkeeperServer {
            transport,
            http,
            state,
            http_settings,
        })
    }
}

impl Default for SlotkeeperServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Background tasks that live as long as [`SlotkeeperServer::run`].
struct TaskSet(Vec<JoinHandle<()>>);

impl Drop for TaskSet {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// A bound slotkeeper server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct SlotkeeperServer<B: SessionBackend, C: Codec> {
    transport: WebSocketTransport,
    http: TcpListener,
    state: Arc<ServerState<B, C>>,
    http_settings: HttpSettings,
}

impl<B, C> SlotkeeperServer<B, C>
where
    B: SessionBackend,
    C: Codec,
{
    /// Returns the address the WebSocket listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Returns the address the HTTP API is bound to.
    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }

    /// The orchestrator, for shutdown and administrative calls.
    pub fn orchestrator(&self) -> Orchestrator<B> {
        self.state.orchestrator.clone()
    }

    /// Runs the server.
    ///
    /// Serves the HTTP API and limiter housekeeping in the background, then
    /// accepts WebSocket peers. Each peer is handed to its own task, which
    /// runs the handshake, refuses addresses over the connection limit, and
    /// handles the rest. Runs until the future is dropped.
    pub async fn run(mut self) -> Result<(), SlotkeeperError> {
        let app = http::router(self.state.orchestrator.clone(), self.http_settings.clone());
        let http = self.http;
        let http_task = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(http, service).await {
                tracing::error!(error = %e, "http server stopped");
            }
        });

        let orchestrator = self.state.orchestrator.clone();
        let housekeeping = tokio::spawn(async move {
            let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let removed = orchestrator.cleanup_rate_limits();
                if removed > 0 {
                    tracing::debug!(removed, "swept rate limit buckets");
                }
            }
        });
        let _tasks = TaskSet(vec![http_task, housekeeping]);

        tracing::info!(
            ws = ?self.transport.local_addr().ok(),
            "slotkeeper server running"
        );

        loop {
            let incoming = match self.transport.accept().await {
                Ok(incoming) => incoming,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            tokio::spawn(admit(incoming, Arc::clone(&self.state)));
        }
    }
}

/// Upgrades one peer, applies the connection limiter, and runs its handler.
async fn admit<B, C>(incoming: IncomingWebSocket, state: Arc<ServerState<B, C>>)
where
    B: SessionBackend,
    C: Codec,
{
    let addr = incoming.addr();
    let conn = match incoming.upgrade().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!(%addr, error = %e, "handshake failed");
            return;
        }
    };

    let ip = conn.peer().client_ip().to_string();
    let decision = state.orchestrator.connection_limiter().check(&ip, true);
    if !decision.allowed {
        tracing::info!(%ip, retry_after_secs = decision.retry_after_secs, "connection rate limited");
        let reason = format!(
            "Too many connections. Retry in {} seconds.",
            decision.retry_after_secs
        );
        let _ = conn.close(CLOSE_RATE_LIMITED, &reason).await;
        return;
    }

    if let Err(e) = handle_connection(conn, state).await {
        tracing::debug!(error = %e, "connection ended with error");
    }
}
