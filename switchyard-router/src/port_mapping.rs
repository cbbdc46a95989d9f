//! `--register-port-mapping`: open the router port for inbound TCP in the host firewall.

use crate::error::{Result, RouterError};

const RULE_NAME: &str = "Switchyard Router";

/// Program and arguments that add an inbound allow rule for `port`, or `None` where
/// the platform has no supported firewall command.
pub fn firewall_command(port: u16) -> Option<(&'static str, Vec<String>)> {
    if !cfg!(windows) {
        return None;
    }
    Some((
        "netsh",
        vec![
            "advfirewall".into(),
            "firewall".into(),
            "add".into(),
            "rule".into(),
            format!("name={} {}", RULE_NAME, port),
            "dir=in".into(),
            "action=allow".into(),
            "protocol=TCP".into(),
            format!("localport={}", port),
        ],
    ))
}

/// Run the firewall command for `port`.
pub async fn register_port_mapping(port: u16) -> Result<()> {
    let (program, args) =
        firewall_command(port).ok_or(RouterError::Unsupported("port mapping registration"))?;
    let output = tokio::process::Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(|source| RouterError::Spawn {
            path: program.into(),
            source,
        })?;
    if !output.status.success() {
        return Err(RouterError::Tool {
            program: program.to_string(),
            message: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        });
    }
    tracing::info!(port, "registered firewall rule");
    Ok(())
}
