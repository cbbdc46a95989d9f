//! Service registry: one slot per URL holding either a connected service or a process
//! that was spawned and has not announced itself yet.
//!
//! Slots are keyed by the URL path (query parameters stripped). Registration and
//! spawning share one lock, so concurrent requests for an unseen URL start one process.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{parse_url, Message, Route};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, RouterError};
use crate::launcher::{LaunchRequest, ProcessLauncher};
use crate::package::PackageLocator;
use crate::transport::{write_message, ConnectionId};

/// How long a client waits for a spawned service to announce itself.
pub const DEFAULT_SERVICE_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment handed to spawned services: where to dial back, and which URL they serve.
pub const ROUTER_PORT_ENV: &str = "SWITCHYARD_ROUTER_PORT";
pub const SERVICE_URL_ENV: &str = "SWITCHYARD_SERVICE_URL";

/// Upper bound on flushing a closed service's write side.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type ServiceWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A registered service: the write side of its command channel behind a send lock.
pub struct ServiceHandle {
    id: ConnectionId,
    url: String,
    writer: Mutex<ServiceWriter>,
    closed: watch::Sender<bool>,
}

impl ServiceHandle {
    pub fn new<W>(id: ConnectionId, url: impl Into<String>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            id,
            url: url.into(),
            writer: Mutex::new(Box::new(writer)),
            closed: watch::channel(false).0,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ask the service to dial back with `guid`. Writes never interleave, and a write
    /// stalled on a peer that stopped reading gives up once the handle is closed.
    pub async fn request_server(&self, url: &str, guid: Uuid) -> Result<()> {
        let msg = Message::ServiceRequestServer {
            url: url.to_string(),
            guid,
        };
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(RouterError::ConnectionClosed);
        }
        let mut w = self.writer.lock().await;
        tokio::select! {
            written = async {
                write_message(&mut *w, &msg).await?;
                w.flush().await?;
                Ok::<(), RouterError>(())
            } => written,
            _ = closed.wait_for(|c| *c) => Err(RouterError::ConnectionClosed),
        }
    }

    /// Signal the read loop to stop and shut the write side down. Never waits on a
    /// stalled peer for longer than `CLOSE_TIMEOUT`.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        let shutdown = async {
            let mut w = self.writer.lock().await;
            w.shutdown().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection = %self.id, "service shutdown failed: {}", e),
            Err(_) => debug!(connection = %self.id, "service shutdown timed out"),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves (changes to `true`) when the registry drops this service.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

#[derive(Clone)]
enum Slot {
    Starting,
    Ready(Arc<ServiceHandle>),
    Failed(String),
}

struct Entry {
    state: watch::Sender<Slot>,
    generation: u64,
}

/// Outcome of `ServiceRegistry::register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Installed,
    /// Task registration displaced (and closed) an earlier service.
    Replaced,
    /// A service already holds the URL; first registration wins.
    Ignored,
}

/// Awaitable handle on a slot that may still be starting.
pub struct PendingService {
    url: String,
    rx: watch::Receiver<Slot>,
    timeout: Duration,
}

impl PendingService {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn wait(self) -> Result<Arc<ServiceHandle>> {
        let PendingService {
            url,
            mut rx,
            timeout,
        } = self;
        let waited =
            tokio::time::timeout(timeout, rx.wait_for(|s| !matches!(s, Slot::Starting))).await;
        match waited {
            Err(_) => Err(RouterError::ServiceStartTimeout { url, timeout }),
            Ok(Err(_)) => Err(RouterError::ServiceUnavailable {
                url,
                reason: "registration dropped".into(),
            }),
            Ok(Ok(slot)) => match &*slot {
                Slot::Ready(service) => Ok(service.clone()),
                Slot::Failed(reason) => Err(RouterError::ServiceUnavailable {
                    url: url.clone(),
                    reason: reason.clone(),
                }),
                Slot::Starting => Err(RouterError::ServiceUnavailable {
                    url: url.clone(),
                    reason: "still starting".into(),
                }),
            },
        }
    }
}

pub struct ServiceRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    locator: Arc<dyn PackageLocator>,
    launcher: Arc<dyn ProcessLauncher>,
    start_timeout: Duration,
    service_port: u16,
    generation: AtomicU64,
}

fn registry_key(url: &str) -> String {
    parse_url(url).path()
}

impl ServiceRegistry {
    pub fn new(
        locator: Arc<dyn PackageLocator>,
        launcher: Arc<dyn ProcessLauncher>,
        start_timeout: Duration,
        service_port: u16,
    ) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            locator,
            launcher,
            start_timeout,
            service_port,
            generation: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Install `service` for `url`. Non-task: first registration wins. Task: replaces
    /// and closes whatever was there. A spawned process's starting slot is resolved either way.
    pub async fn register(
        &self,
        url: &str,
        service: Arc<ServiceHandle>,
        is_task: bool,
    ) -> Registration {
        let key = registry_key(url);
        let mut entries = self.entries.lock().await;
        let current = entries.get(&key).map(|e| e.state.borrow().clone());
        let (outcome, displaced) = match current {
            Some(Slot::Ready(old)) if is_task || old.is_closed() => {
                (Registration::Replaced, Some(old))
            }
            Some(Slot::Ready(_)) => (Registration::Ignored, None),
            _ => (Registration::Installed, None),
        };
        if outcome != Registration::Ignored {
            // A starting slot is resolved in place so its waiters wake up.
            if let Some(entry) = entries.get(&key) {
                entry.state.send_replace(Slot::Ready(service));
            } else {
                let generation = self.next_generation();
                entries.insert(
                    key.clone(),
                    Entry {
                        state: watch::channel(Slot::Ready(service)).0,
                        generation,
                    },
                );
            }
        }
        drop(entries);

        match outcome {
            Registration::Installed => info!(url = %key, "service registered"),
            Registration::Replaced => info!(url = %key, "service replaced"),
            Registration::Ignored => debug!(url = %key, "service already registered; ignoring"),
        }
        if let Some(old) = displaced {
            old.close().await;
        }
        outcome
    }

    /// Remove the slot for `url` if it still belongs to connection `id`.
    pub async fn unregister(&self, url: &str, id: ConnectionId) -> bool {
        let key = registry_key(url);
        let mut entries = self.entries.lock().await;
        let owned = entries
            .get(&key)
            .map(|e| matches!(&*e.state.borrow(), Slot::Ready(s) if s.id() == id))
            .unwrap_or(false);
        if owned {
            entries.remove(&key);
            info!(url = %key, connection = %id, "service unregistered");
        }
        owned
    }

    pub async fn lookup(&self, url: &str) -> Option<Arc<ServiceHandle>> {
        let entries = self.entries.lock().await;
        let entry = entries.get(&registry_key(url))?;
        let slot = entry.state.borrow();
        match &*slot {
            Slot::Ready(service) => Some(service.clone()),
            _ => None,
        }
    }

    /// Return a waiter on the slot for `url`, spawning the service's process if no slot exists.
    /// Everything that can fail (URL, package, executable, spawn) fails before a slot is created.
    pub async fn resolve_or_spawn(&self, url: &str) -> Result<PendingService> {
        let parsed = parse_url(url);
        let key = parsed.path();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&key) {
            return Ok(PendingService {
                url: key,
                rx: entry.state.subscribe(),
                timeout: self.start_timeout,
            });
        }

        let (package, version, process) = match parsed.route()? {
            Route::Service {
                package,
                version,
                process,
                ..
            } => (package, version, process),
            _ => return Err(RouterError::UnsupportedUrl(url.to_string())),
        };
        let pkg = self.locator.find_package(&package, &version)?;
        let exe = pkg
            .find_file(&process)
            .ok_or_else(|| RouterError::ExecutableNotFound {
                name: package.clone(),
                version: pkg.version.clone(),
                process: process.clone(),
            })?;
        let args = if parsed.parameters.is_empty() {
            Vec::new()
        } else {
            vec![parsed.parameters.clone()]
        };
        let spawned = self.launcher.launch(LaunchRequest {
            working_dir: exe.parent().map(Path::to_path_buf),
            program: exe,
            args,
            env: vec![
                (ROUTER_PORT_ENV.to_string(), self.service_port.to_string()),
                (SERVICE_URL_ENV.to_string(), key.clone()),
            ],
            label: key.clone(),
        })?;

        let generation = self.next_generation();
        let (tx, rx) = watch::channel(Slot::Starting);
        entries.insert(
            key.clone(),
            Entry {
                state: tx,
                generation,
            },
        );
        drop(entries);

        self.watch_exit(key.clone(), generation, spawned.exited);
        Ok(PendingService {
            url: key,
            rx,
            timeout: self.start_timeout,
        })
    }

    /// Fail and remove the slot if the process exits before announcing itself.
    fn watch_exit(&self, key: String, generation: u64, exited: oneshot::Receiver<Option<i32>>) {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let code = exited.await.ok().flatten();
            let mut entries = entries.lock().await;
            let still_starting = entries
                .get(&key)
                .map(|e| e.generation == generation && matches!(&*e.state.borrow(), Slot::Starting))
                .unwrap_or(false);
            if !still_starting {
                return;
            }
            if let Some(entry) = entries.remove(&key) {
                warn!(url = %key, ?code, "service exited before registering");
                entry.state.send_replace(Slot::Failed(format!(
                    "process exited with code {:?} before registering",
                    code
                )));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::SpawnedProcess;
    use crate::package::tests::touch;
    use crate::package::DirectoryLocator;
    use crate::transport::read_message;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    #[derive(Default)]
    struct FakeLauncher {
        launches: std::sync::Mutex<Vec<LaunchRequest>>,
        exits: std::sync::Mutex<Vec<oneshot::Sender<Option<i32>>>>,
    }

    impl FakeLauncher {
        fn count(&self) -> usize {
            self.launches.lock().unwrap().len()
        }

        fn exit_last(&self, code: i32) {
            let tx = self.exits.lock().unwrap().pop().unwrap();
            tx.send(Some(code)).unwrap();
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self, request: LaunchRequest) -> Result<SpawnedProcess> {
            self.launches.lock().unwrap().push(request);
            let (tx, rx) = oneshot::channel();
            self.exits.lock().unwrap().push(tx);
            Ok(SpawnedProcess {
                pid: Some(4242),
                exited: rx,
            })
        }
    }

    fn setup(start_timeout: Duration) -> (ServiceRegistry, Arc<FakeLauncher>, TempDir) {
        let scratch = tempfile::tempdir().unwrap();
        touch(scratch.path(), "Pkg/1.0.0/bin/Agent.exe");
        touch(scratch.path(), "Pkg/1.0.0/readme.txt");
        let launcher = Arc::new(FakeLauncher::default());
        let registry = ServiceRegistry::new(
            Arc::new(DirectoryLocator::new(vec![scratch.path().to_path_buf()])),
            launcher.clone(),
            start_timeout,
            31255,
        );
        (registry, launcher, scratch)
    }

    fn service(url: &str) -> (Arc<ServiceHandle>, DuplexStream) {
        let (ours, theirs) = duplex(4096);
        (ServiceHandle::new(ConnectionId::next(), url, ours), theirs)
    }

    const URL: &str = "service/Pkg/1.0.0/Agent.exe";

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_keep_one() {
        let (registry, _, _scratch) = setup(DEFAULT_SERVICE_START_TIMEOUT);
        let registry = Arc::new(registry);
        let mut handles = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..16 {
            let (svc, peer) = service(URL);
            peers.push(peer);
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let id = svc.id();
                (id, registry.register(URL, svc, false).await)
            }));
        }
        let mut installed = Vec::new();
        for h in handles {
            let (id, outcome) = h.await.unwrap();
            match outcome {
                Registration::Installed => installed.push(id),
                Registration::Ignored => {}
                Registration::Replaced => panic!("non-task registration replaced"),
            }
        }
        assert_eq!(installed.len(), 1);
        assert_eq!(registry.lookup(URL).await.unwrap().id(), installed[0]);
    }

    #[tokio::test]
    async fn task_registration_replaces_and_closes() {
        let (registry, _, _scratch) = setup(DEFAULT_SERVICE_START_TIMEOUT);
        let url = "task/Pkg/1.0.0/Agent.exe";
        let (first, mut first_peer) = service(url);
        let (second, _second_peer) = service(url);
        assert_eq!(registry.register(url, first.clone(), true).await, Registration::Installed);
        assert_eq!(registry.register(url, second.clone(), true).await, Registration::Replaced);

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.lookup(url).await.unwrap().id(), second.id());
        let mut rest = Vec::new();
        first_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn closed_service_can_be_superseded() {
        let (registry, _, _scratch) = setup(DEFAULT_SERVICE_START_TIMEOUT);
        let (first, _p1) = service(URL);
        let (second, _p2) = service(URL);
        registry.register(URL, first.clone(), false).await;
        first.close().await;
        assert_eq!(registry.register(URL, second.clone(), false).await, Registration::Replaced);
        assert_eq!(registry.lookup(URL).await.unwrap().id(), second.id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_spawn_once() {
        let (registry, launcher, _scratch) = setup(DEFAULT_SERVICE_START_TIMEOUT);
        let registry = Arc::new(registry);
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            waiters.push(tokio::spawn(async move {
                registry
                    .resolve_or_spawn("service/Pkg/1.0.0/Agent.exe?mode=deploy")
                    .await
                    .unwrap()
                    .wait()
                    .await
            }));
        }
        while launcher.count() == 0 {
            tokio::task::yield_now().await;
        }
        let (svc, _peer) = service(URL);
        assert_eq!(registry.register(URL, svc.clone(), false).await, Registration::Installed);
        for w in waiters {
            assert_eq!(w.await.unwrap().unwrap().id(), svc.id());
        }
        assert_eq!(launcher.count(), 1);

        let request = launcher.launches.lock().unwrap()[0].clone();
        assert!(request.program.ends_with("bin/Agent.exe"));
        assert_eq!(request.args, vec!["mode=deploy".to_string()]);
        assert_eq!(request.working_dir.as_deref(), request.program.parent());
        assert!(request
            .env
            .contains(&(ROUTER_PORT_ENV.to_string(), "31255".to_string())));
        assert!(request
            .env
            .contains(&(SERVICE_URL_ENV.to_string(), URL.to_string())));
    }

    #[tokio::test]
    async fn registered_service_resolves_without_spawn() {
        let (registry, launcher, _scratch) = setup(DEFAULT_SERVICE_START_TIMEOUT);
        let (svc, _peer) = service(URL);
        registry.register(URL, svc.clone(), false).await;
        let found = registry.resolve_or_spawn(URL).await.unwrap().wait().await.unwrap();
        assert_eq!(found.id(), svc.id());
        assert_eq!(launcher.count(), 0);
    }

    #[tokio::test]
    async fn resolution_faults_fail_before_spawn() {
        let (registry, launcher, _scratch) = setup(DEFAULT_SERVICE_START_TIMEOUT);
        assert!(matches!(
            registry.resolve_or_spawn("service/Pkg/1.0.0").await,
            Err(RouterError::Url(_))
        ));
        assert!(matches!(
            registry.resolve_or_spawn("service/Nope/1.0.0/Agent.exe").await,
            Err(RouterError::PackageNotFound { .. })
        ));
        assert!(matches!(
            registry.resolve_or_spawn("service/Pkg/1.0.0/Other.exe").await,
            Err(RouterError::ExecutableNotFound { .. })
        ));
        assert_eq!(launcher.count(), 0);
        assert!(registry.lookup(URL).await.is_none());
    }

    #[tokio::test]
    async fn early_exit_fails_waiters_and_allows_respawn() {
        let (registry, launcher, _scratch) = setup(DEFAULT_SERVICE_START_TIMEOUT);
        let pending = registry.resolve_or_spawn(URL).await.unwrap();
        launcher.exit_last(1);
        assert!(matches!(
            pending.wait().await,
            Err(RouterError::ServiceUnavailable { .. })
        ));
        let _again = registry.resolve_or_spawn(URL).await.unwrap();
        assert_eq!(launcher.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_service_times_out() {
        let (registry, _launcher, _scratch) = setup(Duration::from_secs(10));
        let pending = registry.resolve_or_spawn(URL).await.unwrap();
        assert!(matches!(
            pending.wait().await,
            Err(RouterError::ServiceStartTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn unregister_requires_same_connection() {
        let (registry, _, _scratch) = setup(DEFAULT_SERVICE_START_TIMEOUT);
        let (svc, _peer) = service(URL);
        let (other, _other_peer) = service(URL);
        registry.register(URL, svc.clone(), false).await;
        assert!(!registry.unregister(URL, other.id()).await);
        assert!(registry.unregister(URL, svc.id()).await);
        assert!(registry.lookup(URL).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_do_not_interleave() {
        let (svc, mut peer) = service(URL);
        let mut guids = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let guid = Uuid::new_v4();
            guids.push(guid);
            let svc = svc.clone();
            handles.push(tokio::spawn(async move { svc.request_server(URL, guid).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..20 {
            match read_message(&mut peer).await.unwrap() {
                Message::ServiceRequestServer { url, guid } => {
                    assert_eq!(url, URL);
                    seen.push(guid);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        seen.sort();
        guids.sort();
        assert_eq!(seen, guids);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_does_not_wait_on_stalled_peer() {
        let (ours, _peer) = duplex(64);
        let svc = ServiceHandle::new(ConnectionId::next(), URL, ours);
        let long_url = format!("{}?{}", URL, "x".repeat(4096));
        let stuck = tokio::spawn({
            let svc = svc.clone();
            async move { svc.request_server(&long_url, Uuid::new_v4()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stuck.is_finished());

        tokio::time::timeout(Duration::from_secs(2), svc.close())
            .await
            .expect("close blocked behind a stalled write");
        assert!(svc.is_closed());
        let stuck = tokio::time::timeout(Duration::from_secs(2), stuck)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(stuck, Err(RouterError::ConnectionClosed)));
        assert!(matches!(
            svc.request_server(URL, Uuid::new_v4()).await,
            Err(RouterError::ConnectionClosed)
        ));
    }
}
