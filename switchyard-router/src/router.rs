//! Router core. Every accepted (or dialed) connection announces its role with its first
//! message: a client asking for a server, a service offering itself, or a service calling
//! back for an earlier request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{parse_url, Message, Route, StartStatus, DEFAULT_SERVICE_PORT};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, RouterError};
use crate::forward::forward;
use crate::launcher::ProcessLauncher;
use crate::package::PackageLocator;
use crate::pending::{PendingServers, DEFAULT_PENDING_TIMEOUT};
use crate::registry::{ServiceHandle, ServiceRegistry, DEFAULT_SERVICE_START_TIMEOUT};
use crate::transport::{self, read_message, Connection, Listener};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The flow of one established connection, ready to be spawned.
pub type Session = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    /// How long a client waits for the service's callback connection.
    pub pending_timeout: Duration,
    /// How long a client waits for a spawned service to register.
    pub service_start_timeout: Duration,
    /// Port spawned services are told to dial back on.
    pub service_port: u16,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            service_start_timeout: DEFAULT_SERVICE_START_TIMEOUT,
            service_port: DEFAULT_SERVICE_PORT,
        }
    }
}

struct RouterInner {
    registry: ServiceRegistry,
    pending: PendingServers,
}

/// Shared router state. Cloning is cheap; every connection task holds a clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        options: RouterOptions,
        locator: Arc<dyn PackageLocator>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry: ServiceRegistry::new(
                    locator,
                    launcher,
                    options.service_start_timeout,
                    options.service_port,
                ),
                pending: PendingServers::new(options.pending_timeout),
            }),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn pending(&self) -> &PendingServers {
        &self.inner.pending
    }

    /// Accept connections until `shutdown` resolves, one task per connection.
    /// In-flight connections are aborted on shutdown.
    pub async fn serve<F>(&self, listener: Listener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "router listening"),
            Err(e) => warn!("router listening on unknown address: {}", e),
        }
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        let router = self.clone();
                        tasks.spawn(async move { router.run_connection(conn).await });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("connection task panicked: {}", e);
                        }
                    }
                }
            }
        }
        info!(in_flight = tasks.len(), "router shutting down");
        tasks.shutdown().await;
    }

    /// Dial out to a device-forwarded endpoint, where the remote side cannot reach us.
    /// Returns once connected; the returned future runs the connection's flow exactly
    /// like an accepted one, so the caller decides where it is spawned.
    pub async fn try_connect(&self, address: &str, port: u16) -> Result<Session> {
        let conn = transport::connect(address, port).await?;
        debug!(connection = %conn.id(), address, port, "connected out");
        let router = self.clone();
        Ok(Box::pin(async move { router.run_connection(conn).await }))
    }

    async fn run_connection(&self, conn: Connection) {
        let id = conn.id();
        debug!(connection = %id, remote = %conn.remote(), "connection opened");
        match self.handle_connection(conn).await {
            Ok(()) => debug!(connection = %id, "connection finished"),
            Err(RouterError::ConnectionClosed) => debug!(connection = %id, "peer closed"),
            Err(e) => warn!(connection = %id, "connection failed: {}", e),
        }
    }

    /// Read the first message and run the matching flow to completion.
    pub async fn handle_connection(&self, mut conn: Connection) -> Result<()> {
        match conn.read_message().await? {
            Message::ClientRequestServer { url } => self.client_flow(conn, url).await,
            Message::ServiceProvideServer { url } => self.service_flow(conn, url, false).await,
            Message::TaskProvideServer { url } => self.service_flow(conn, url, true).await,
            Message::ServerStarted { guid, status } => {
                self.callback_flow(conn, guid, status).await;
                Ok(())
            }
            other => Err(RouterError::UnexpectedMessage(other.kind())),
        }
    }

    async fn client_flow(&self, mut client: Connection, url: String) -> Result<()> {
        let client_id = client.id();
        info!(client = %client_id, %url, "client requested server");
        match self.open_server(&url).await {
            Ok(server) => {
                client
                    .send(&Message::ClientServerStarted {
                        status: StartStatus::Started,
                    })
                    .await?;
                info!(client = %client_id, server = %server.id(), %url, "forwarding");
                forward(client, server).await?;
                debug!(client = %client_id, %url, "forwarding finished");
                Ok(())
            }
            Err(e) => {
                let status = StartStatus::failed(e.code(), e.to_string());
                client.send(&Message::ClientServerStarted { status }).await?;
                Err(e)
            }
        }
    }

    /// Resolve `url` to a fresh server connection from its service.
    async fn open_server(&self, url: &str) -> Result<Connection> {
        match parse_url(url).route()? {
            Route::Service { .. } => {}
            Route::Redirect { host, port } => {
                return Err(RouterError::RedirectRejected { host, port });
            }
            Route::Unsupported(_) => return Err(RouterError::UnsupportedUrl(url.to_string())),
        }

        let service = self.inner.registry.resolve_or_spawn(url).await?.wait().await?;
        let pending = self.inner.pending.create().await;
        let guid = pending.guid();
        if let Err(e) = service.request_server(url, guid).await {
            self.inner.pending.cancel(guid).await;
            // The command channel is unusable; drop the service so it can be restarted.
            service.close().await;
            return Err(e);
        }
        debug!(%guid, service = %service.id(), "requested server from service");
        pending.wait().await
    }

    async fn service_flow(&self, conn: Connection, url: String, is_task: bool) -> Result<()> {
        let id = conn.id();
        let (mut reader, writer) = tokio::io::split(conn);
        let service = ServiceHandle::new(id, url.clone(), writer);
        let mut closed = service.closed_signal();
        let outcome = self
            .inner
            .registry
            .register(&url, service.clone(), is_task)
            .await;
        info!(connection = %id, %url, task = is_task, ?outcome, "service connected");

        let result = loop {
            tokio::select! {
                msg = read_message(&mut reader) => match msg {
                    Ok(msg) => debug!(connection = %id, kind = ?msg.kind(), "ignoring message on service channel"),
                    Err(RouterError::ConnectionClosed) => break Ok(()),
                    Err(e) => break Err(e),
                },
                _ = closed.changed() => break Ok(()),
            }
        };
        self.inner.registry.unregister(&url, id).await;
        info!(connection = %id, %url, "service disconnected");
        result
    }

    async fn callback_flow(&self, conn: Connection, guid: Uuid, status: StartStatus) {
        debug!(connection = %conn.id(), %guid, started = status.is_started(), "server callback");
        let result = match status {
            StartStatus::Started => Ok(conn),
            StartStatus::Failed { code, message } => Err(RouterError::ServerFailed { code, message }),
        };
        self.inner.pending.fulfill(guid, result).await;
    }
}
