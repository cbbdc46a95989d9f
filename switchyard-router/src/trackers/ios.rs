//! iOS devices via libimobiledevice: `idevice_id` to list, an `iproxy` child per device
//! to forward.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{run_tool, DeviceBackend, DeviceInfo};
use crate::error::{Result, RouterError};

pub struct IosBackend {
    idevice_id: PathBuf,
    iproxy: PathBuf,
    device_port: u16,
    /// udid -> running iproxy; dropping the child kills it.
    proxies: Mutex<HashMap<String, Child>>,
}

impl IosBackend {
    pub fn new(idevice_id: PathBuf, iproxy: PathBuf, device_port: u16) -> Self {
        Self {
            idevice_id,
            iproxy,
            device_port,
            proxies: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DeviceBackend for IosBackend {
    fn platform(&self) -> &'static str {
        "ios"
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let out = run_tool(&self.idevice_id, &["-l"]).await?;
        Ok(parse_udids(&out))
    }

    async fn forward(&self, device: &DeviceInfo) -> Result<(String, u16)> {
        let local = free_local_port()?;
        let child = Command::new(&self.iproxy)
            .arg(local.to_string())
            .arg(self.device_port.to_string())
            .arg("-u")
            .arg(&device.key)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RouterError::Spawn {
                path: self.iproxy.clone(),
                source,
            })?;
        debug!(udid = %device.key, local, pid = ?child.id(), "started iproxy");
        self.proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.key.clone(), child);
        Ok(("127.0.0.1".to_string(), local))
    }

    async fn release(&self, device: &DeviceInfo) {
        let child = self
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device.key);
        if let Some(mut child) = child {
            let _ = child.start_kill();
        }
    }
}

/// One UDID per line.
pub fn parse_udids(out: &str) -> Vec<DeviceInfo> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|udid| DeviceInfo::new(udid, udid))
        .collect()
}

fn free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
