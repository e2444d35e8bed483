//! `UpendServer` builder and server loop.
//!
//! This is the entry point for running an Upend. It ties together all the
//! layers: transport → protocol → session supervisor → command handler.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_protocol::{
    DownwardDuty, Envelope, HandshakeTerms, JsonCodec, PROTOCOL_VERSION, Pipeline, TimeBoundary,
    UpwardDuty, pipeline,
};
use tether_session::{
    ChannelCloser, SecondaryAuthenticator, SessionAuthority, SessionSupervisor, SupervisorConfig,
};
use tether_transport::{Connection, Transport, TransportError, WebSocketTransport};

use crate::command::CommandHandler;
use crate::config::UpendConfig;
use crate::handler::handle_connection;
use crate::registry::ChannelRegistry;
use crate::TetherError;

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<H> {
    pub(crate) supervisor: SessionSupervisor,
    pub(crate) registry: Arc<ChannelRegistry>,
    pub(crate) handler: H,
    pub(crate) codec: JsonCodec,
    /// Sent in every `Welcome`.
    pub(crate) terms: HandshakeTerms,
    pub(crate) handshake_timeout: Duration,
    pub(crate) pipeline: Pipeline<Envelope<UpwardDuty>, Envelope<DownwardDuty>>,
}

/// Builder for configuring and starting an Upend.
///
/// # Example
///
/// ```rust,ignore
/// use tether::prelude::*;
///
/// let server = UpendServer::builder()
///     .bind("0.0.0.0:9000")
///     .build(my_authority, NoSecondaryAuthentication, MyCommands)
///     .await?;
/// server.run().await
/// ```
#[derive(Debug, Clone, Default)]
pub struct UpendServerBuilder {
    config: UpendConfig,
}

impl UpendServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a complete configuration, e.g. one loaded from a file.
    pub fn config(mut self, config: UpendConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_address = addr.to_string();
        self
    }

    pub fn authentication_required(mut self, required: bool) -> Self {
        self.config.authentication_required = required;
        self
    }

    /// Sets the timings announced to Downends.
    pub fn time_boundary(mut self, boundary: TimeBoundary) -> Self {
        self.config.time_boundary = boundary;
        self
    }

    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.config.supervisor = config;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Binds a WebSocket listener and builds the server.
    pub async fn build<A, S, H>(
        self,
        authority: A,
        secondary: S,
        handler: H,
    ) -> Result<UpendServer<WebSocketTransport, H>, TetherError>
    where
        A: SessionAuthority,
        S: SecondaryAuthenticator,
        H: CommandHandler,
    {
        let transport = WebSocketTransport::bind(&self.config.bind_address).await?;
        Ok(self.build_on(transport, authority, secondary, handler))
    }

    /// Builds the server on an already-open transport.
    ///
    /// Must run inside a Tokio runtime: the session supervisor starts here.
    pub fn build_on<T, A, S, H>(
        self,
        transport: T,
        authority: A,
        secondary: S,
        handler: H,
    ) -> UpendServer<T, H>
    where
        T: Transport,
        A: SessionAuthority,
        S: SecondaryAuthenticator,
        H: CommandHandler,
    {
        let config = self.config.validated();
        let registry = Arc::new(ChannelRegistry::default());
        let closer: Arc<dyn ChannelCloser> = registry.clone();
        let supervisor =
            SessionSupervisor::spawn(config.supervisor.clone(), authority, secondary, closer);

        let state = Arc::new(ServerState {
            supervisor,
            registry,
            handler,
            codec: JsonCodec,
            terms: HandshakeTerms {
                protocol_version: PROTOCOL_VERSION,
                authentication_required: config.authentication_required,
                time_boundary: config.time_boundary,
            },
            handshake_timeout: config.handshake_timeout,
            pipeline: Pipeline::new()
                .with_stage(pipeline::answer_pings)
                .with_stage(pipeline::drop_untagged_commands),
        });

        UpendServer { transport, state }
    }
}

/// A running Upend.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct UpendServer<T, H> {
    transport: T,
    state: Arc<ServerState<H>>,
}

impl UpendServer<WebSocketTransport, ()> {
    /// Creates a new builder.
    pub fn builder() -> UpendServerBuilder {
        UpendServerBuilder::new()
    }
}

impl<H: CommandHandler> UpendServer<WebSocketTransport, H> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }
}

impl<T, H> UpendServer<T, H>
where
    T: Transport,
    T::Connection: Connection<Error = TransportError>,
    H: CommandHandler,
{
    /// A handle on the session supervisor, e.g. to kick sessions out.
    pub fn supervisor(&self) -> SessionSupervisor {
        self.state.supervisor.clone()
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), TetherError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` completes, then kicks every
    /// session out and stops the supervisor.
    pub async fn run_until(
        mut self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), TetherError> {
        tracing::info!("upend running");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                () = &mut shutdown => break,
            }
        }

        tracing::info!("upend shutting down");
        if let Err(e) = self.transport.shutdown().await {
            tracing::warn!(error = %e, "transport shutdown failed");
        }
        let kicked = self.state.supervisor.kickout_all("upend shutting down").await?;
        tracing::info!(kicked, "sessions closed");
        self.state.supervisor.shutdown().await?;
        Ok(())
    }
}
