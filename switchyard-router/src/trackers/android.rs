//! Android devices via `adb`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{run_tool, DeviceBackend, DeviceInfo};
use crate::error::{Result, RouterError};

pub struct AndroidBackend {
    adb: PathBuf,
    device_port: u16,
    /// serial -> local port allocated by `adb forward tcp:0`.
    forwards: Mutex<HashMap<String, u16>>,
}

impl AndroidBackend {
    pub fn new(adb: PathBuf, device_port: u16) -> Self {
        Self {
            adb,
            device_port,
            forwards: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DeviceBackend for AndroidBackend {
    fn platform(&self) -> &'static str {
        "android"
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let out = run_tool(&self.adb, &["devices", "-l"]).await?;
        Ok(parse_devices(&out))
    }

    async fn forward(&self, device: &DeviceInfo) -> Result<(String, u16)> {
        let remote = format!("tcp:{}", self.device_port);
        let out = run_tool(&self.adb, &["-s", &device.key, "forward", "tcp:0", &remote]).await?;
        let port = out.trim().parse::<u16>().map_err(|_| RouterError::Tool {
            program: "adb forward".into(),
            message: format!("unexpected output {:?}", out.trim()),
        })?;
        self.forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.key.clone(), port);
        Ok(("127.0.0.1".to_string(), port))
    }

    async fn release(&self, device: &DeviceInfo) {
        let port = self
            .forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device.key);
        let Some(port) = port else {
            return;
        };
        let local = format!("tcp:{}", port);
        if let Err(e) = run_tool(&self.adb, &["-s", &device.key, "forward", "--remove", &local]).await
        {
            // The device is usually gone already, taking the forward with it.
            debug!(device = %device.key, "adb forward --remove failed: {}", e);
        }
    }
}

/// Parse `adb devices -l`: devices in the `device` state, named by their model.
pub fn parse_devices(out: &str) -> Vec<DeviceInfo> {
    out.lines()
        .skip_while(|l| !l.starts_with("List of devices attached"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            if fields.next()? != "device" {
                return None;
            }
            let name = fields
                .find_map(|f| f.strip_prefix("model:"))
                .unwrap_or(serial);
            Some(DeviceInfo::new(serial, name))
        })
        .collect()
}
