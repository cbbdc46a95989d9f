//! Device trackers: poll a platform tool for attached devices, forward a local port to
//! the router inside each device, and keep dialing it until the device goes away.

pub mod android;
pub mod ios;
pub mod winphone;

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, RouterError};
use crate::router::{Router, Session};

pub use android::AndroidBackend;
pub use ios::IosBackend;
pub use winphone::WinPhoneBackend;

/// An attached device as reported by the platform tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable identity across polls (serial, UDID or port).
    pub key: String,
    pub name: String,
}

impl DeviceInfo {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
        }
    }
}

/// A device the tracker has forwarded to. The flag stops its retry loop.
#[derive(Debug)]
pub struct ConnectedDevice {
    pub info: DeviceInfo,
    disconnected: Arc<AtomicBool>,
}

impl ConnectedDevice {
    fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerTiming {
    pub poll_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for TrackerTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            retry_interval: Duration::from_millis(200),
        }
    }
}

/// Platform-specific device enumeration and port forwarding.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    fn platform(&self) -> &'static str;
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>>;
    /// Make the device's router reachable locally; returns the address to dial.
    async fn forward(&self, device: &DeviceInfo) -> Result<(String, u16)>;
    async fn release(&self, device: &DeviceInfo);
}

/// Where the tracker hands forwarded endpoints.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Connect to the endpoint. Returns as soon as the connection is up; the session
    /// runs when the tracker spawns it.
    async fn try_connect(&self, address: &str, port: u16) -> Result<Session>;
}

#[async_trait]
impl DeviceConnector for Router {
    async fn try_connect(&self, address: &str, port: u16) -> Result<Session> {
        Router::try_connect(self, address, port).await
    }
}

/// Poll `backend` forever. New devices are forwarded and dialed every
/// `retry_interval` until a later poll no longer lists them. Dropping the returned
/// future stops every dial loop and session it started.
pub async fn run_tracker(
    connector: Arc<dyn DeviceConnector>,
    backend: Arc<dyn DeviceBackend>,
    timing: TrackerTiming,
) {
    let platform = backend.platform();
    let mut devices: HashMap<String, ConnectedDevice> = HashMap::new();
    let mut dialers = JoinSet::new();
    info!(platform, "device tracker started");
    loop {
        match backend.enumerate().await {
            Ok(found) => {
                let gone: Vec<String> = devices
                    .keys()
                    .filter(|k| !found.iter().any(|d| &d.key == *k))
                    .cloned()
                    .collect();
                for key in gone {
                    if let Some(device) = devices.remove(&key) {
                        device.disconnect();
                        backend.release(&device.info).await;
                        info!(platform, device = %device.info.name, "device disconnected");
                    }
                }
                for info in found {
                    if devices.contains_key(&info.key) {
                        continue;
                    }
                    match backend.forward(&info).await {
                        Ok((address, port)) => {
                            info!(platform, device = %info.name, %address, port, "device connected");
                            let device = ConnectedDevice::new(info);
                            dialers.spawn(dial_loop(
                                connector.clone(),
                                address,
                                port,
                                device.disconnected.clone(),
                                timing.retry_interval,
                            ));
                            devices.insert(device.info.key.clone(), device);
                        }
                        Err(e) => {
                            debug!(platform, device = %info.name, "forward failed: {}", e)
                        }
                    }
                }
            }
            Err(e) => debug!(platform, "enumeration failed: {}", e),
        }
        sleep_reaping(&mut dialers, timing.poll_interval).await;
    }
}

/// Dial the device every `retry_interval`, keeping each established session running
/// alongside further dials. Sessions are aborted when the device goes away.
async fn dial_loop(
    connector: Arc<dyn DeviceConnector>,
    address: String,
    port: u16,
    disconnected: Arc<AtomicBool>,
    retry_interval: Duration,
) {
    let mut sessions = JoinSet::new();
    while !disconnected.load(Ordering::Acquire) {
        match connector.try_connect(&address, port).await {
            Ok(session) => {
                sessions.spawn(session);
            }
            Err(e) => debug!(%address, port, "device connection failed: {}", e),
        }
        sleep_reaping(&mut sessions, retry_interval).await;
    }
    if !sessions.is_empty() {
        debug!(%address, port, open = sessions.len(), "dropping device sessions");
    }
}

/// Sleep for `period` while collecting tasks that finish in the meantime.
async fn sleep_reaping(tasks: &mut JoinSet<()>, period: Duration) {
    let wake = tokio::time::sleep(period);
    tokio::pin!(wake);
    loop {
        tokio::select! {
            _ = &mut wake => return,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("tracker task panicked: {}", e);
                    }
                }
            }
        }
    }
}

/// Run a platform tool to completion and return its stdout.
pub(crate) async fn run_tool(program: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| RouterError::Spawn {
            path: program.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(RouterError::Tool {
            program: program.display().to_string(),
            message: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LaunchRequest, ProcessLauncher, SpawnedProcess};
    use crate::package::{Package, PackageLocator};
    use crate::router::RouterOptions;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    /// Poison `lock` by panicking while it is held.
    #[cfg(unix)]
    pub(crate) fn poison<T>(lock: &Mutex<T>) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _held = lock.lock().unwrap();
            panic!("poisoning lock");
        }));
        assert!(lock.is_poisoned());
    }

    /// Write an executable shell script named `name` under `dir` that runs `body`.
    #[cfg(unix)]
    pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct ScriptedBackend {
        polls: Mutex<Vec<Vec<DeviceInfo>>>,
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceBackend for ScriptedBackend {
        fn platform(&self) -> &'static str {
            "test"
        }

        async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
            let mut polls = self.polls.lock().unwrap();
            if polls.len() > 1 {
                Ok(polls.remove(0))
            } else {
                Ok(polls.first().cloned().unwrap_or_default())
            }
        }

        async fn forward(&self, device: &DeviceInfo) -> Result<(String, u16)> {
            Ok(("127.0.0.1".into(), device.key.parse().unwrap()))
        }

        async fn release(&self, device: &DeviceInfo) {
            self.released.lock().unwrap().push(device.key.clone());
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeviceConnector for CountingConnector {
        async fn try_connect(&self, _: &str, _: u16) -> Result<Session> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RouterError::ConnectionClosed)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_device_is_removed() {
        let backend = Arc::new(ScriptedBackend {
            polls: Mutex::new(vec![vec![DeviceInfo::new("5555", "phone")], vec![]]),
            released: Mutex::new(Vec::new()),
        });
        let connector = Arc::new(CountingConnector::default());
        let tracker = tokio::spawn(run_tracker(
            connector.clone(),
            backend.clone(),
            TrackerTiming::default(),
        ));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(connector.calls.load(Ordering::SeqCst) >= 3);

        tokio::time::sleep(Duration::from_millis(800)).await;
        let settled = connector.calls.load(Ordering::SeqCst);
        assert_eq!(*backend.released.lock().unwrap(), vec!["5555".to_string()]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), settled);
        tracker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn known_devices_are_forwarded_once() {
        let device = DeviceInfo::new("6000", "tablet");
        let backend = Arc::new(ScriptedBackend {
            polls: Mutex::new(vec![vec![device.clone()]]),
            released: Mutex::new(Vec::new()),
        });
        let connector = Arc::new(CountingConnector::default());
        let tracker = tokio::spawn(run_tracker(
            connector.clone(),
            backend.clone(),
            TrackerTiming {
                poll_interval: Duration::from_millis(100),
                retry_interval: Duration::from_secs(1),
            },
        ));
        // Ten polls, one dial loop: one attempt per second.
        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
        assert!(backend.released.lock().unwrap().is_empty());
        tracker.abort();
    }

    /// Lists whatever the test currently puts in `devices`.
    struct ListedBackend {
        devices: Mutex<Vec<DeviceInfo>>,
    }

    #[async_trait]
    impl DeviceBackend for ListedBackend {
        fn platform(&self) -> &'static str {
            "test"
        }

        async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
            Ok(self.devices.lock().unwrap().clone())
        }

        async fn forward(&self, device: &DeviceInfo) -> Result<(String, u16)> {
            Ok(("127.0.0.1".into(), device.key.parse().unwrap()))
        }

        async fn release(&self, _: &DeviceInfo) {}
    }

    struct NoPackages;

    impl PackageLocator for NoPackages {
        fn find_package(&self, name: &str, version: &str) -> Result<Package> {
            Err(RouterError::PackageNotFound {
                name: name.into(),
                version: version.into(),
            })
        }
    }

    struct NoLauncher;

    impl ProcessLauncher for NoLauncher {
        fn launch(&self, _: LaunchRequest) -> Result<SpawnedProcess> {
            Err(RouterError::Unsupported("launch"))
        }
    }

    fn count(accepted: &Mutex<Vec<TcpStream>>) -> usize {
        accepted.lock().unwrap().len()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_session_does_not_block_further_dials() {
        // The device end accepts router connections and never speaks first.
        let device = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let acceptor = tokio::spawn({
            let accepted = accepted.clone();
            async move {
                while let Ok((stream, _)) = device.accept().await {
                    accepted.lock().unwrap().push(stream);
                }
            }
        });

        let backend = Arc::new(ListedBackend {
            devices: Mutex::new(vec![DeviceInfo::new(port.to_string(), "phone")]),
        });
        let router = Router::new(
            RouterOptions::default(),
            Arc::new(NoPackages),
            Arc::new(NoLauncher),
        );
        let tracker = tokio::spawn(run_tracker(
            Arc::new(router),
            backend.clone(),
            TrackerTiming {
                poll_interval: Duration::from_millis(20),
                retry_interval: Duration::from_millis(20),
            },
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while count(&accepted) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("tracker stopped dialing while a session was idle");
        {
            let streams = accepted.lock().unwrap();
            let mut buf = [0u8; 1];
            let first = streams[0].try_read(&mut buf);
            assert!(
                matches!(&first, Err(e) if e.kind() == std::io::ErrorKind::WouldBlock),
                "first session should still be open: {:?}",
                first
            );
        }

        // Once the device is gone its sessions are dropped.
        backend.devices.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let streams: Vec<TcpStream> = std::mem::take(&mut *accepted.lock().unwrap());
        for mut stream in streams {
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("session outlived its device")
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
        tracker.abort();
        acceptor.abort();
    }
}
