//! Service process launcher. Output is logged line by line; children are killed when the
//! router (and with it the runtime owning the wait task) goes away.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::{Result, RouterError};

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Tag for log lines (the service URL).
    pub label: String,
}

/// A started process. `exited` yields the exit code (None if killed by signal or unknown).
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub exited: oneshot::Receiver<Option<i32>>,
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, request: LaunchRequest) -> Result<SpawnedProcess>;
}

/// Launches with `tokio::process`; must be called from within the runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, request: LaunchRequest) -> Result<SpawnedProcess> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|source| RouterError::Spawn {
            path: request.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(service = %request.label, ?pid, program = %request.program.display(), "started process");

        if let Some(out) = child.stdout.take() {
            tokio::spawn(log_lines(out, request.label.clone(), false));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(log_lines(err, request.label.clone(), true));
        }

        let (tx, rx) = oneshot::channel();
        let label = request.label;
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(service = %label, "failed waiting for process: {}", e);
                    None
                }
            };
            info!(service = %label, ?code, "process exited");
            let _ = tx.send(code);
        });
        Ok(SpawnedProcess { pid, exited: rx })
    }
}

async fn log_lines<R: AsyncRead + Unpin>(reader: R, label: String, stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if stderr {
            warn!(service = %label, "{}", line);
        } else {
            info!(service = %label, "{}", line);
        }
    }
}
