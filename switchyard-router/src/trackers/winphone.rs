//! Windows Phone devices via `IpOverUsbEnum`. The IP-over-USB service already exposes
//! each device's router on a local port, so forwarding is the identity.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{run_tool, DeviceBackend, DeviceInfo};
use crate::error::{Result, RouterError};

pub struct WinPhoneBackend {
    enumerator: PathBuf,
}

impl WinPhoneBackend {
    pub fn new(enumerator: PathBuf) -> Self {
        Self { enumerator }
    }
}

#[async_trait]
impl DeviceBackend for WinPhoneBackend {
    fn platform(&self) -> &'static str {
        "winphone"
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let out = run_tool(&self.enumerator, &[]).await?;
        Ok(parse_enum(&out))
    }

    async fn forward(&self, device: &DeviceInfo) -> Result<(String, u16)> {
        let port = device.key.parse::<u16>().map_err(|_| RouterError::Tool {
            program: "IpOverUsbEnum".into(),
            message: format!("invalid port {:?}", device.key),
        })?;
        Ok(("127.0.0.1".to_string(), port))
    }

    async fn release(&self, _device: &DeviceInfo) {}
}

/// Parse `Name:` / `LocalPort:` lines; each port closes one device entry, keyed by port.
pub fn parse_enum(out: &str) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    let mut name: Option<String> = None;
    for line in out.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("Name:") {
            name = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("LocalPort:") {
            if let Ok(port) = v.trim().parse::<u16>() {
                let key = port.to_string();
                let label = name.take().unwrap_or_else(|| key.clone());
                devices.push(DeviceInfo::new(key, label));
            }
        }
    }
    devices
}
