use std::process::Command;

use anyhow::{bail, Result};

struct NetOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

fn run(args: &[&str]) -> Result<NetOutput> {
    let output = Command::new("docker").args(args).output()?;
    Ok(NetOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
    })
}

/// Resolve the network tenant containers should join.
///
/// Discovery order: the network this process's own container is attached to
/// (when running inside the stack), then any existing network whose name
/// contains the configured fragment, then create a bridge network with the
/// configured name.
pub fn resolve_network(preferred: &str) -> Result<String> {
    if let Some(name) = own_container_network()? {
        tracing::debug!("Using own container network: {}", name);
        return Ok(name);
    }
    if let Some(name) = find_by_fragment(preferred)? {
        tracing::debug!("Using existing network: {}", name);
        return Ok(name);
    }
    ensure_network(preferred)?;
    Ok(preferred.to_string())
}

/// Network of the container this process runs in, when HOSTNAME is a
/// container id. Outside a container the inspect fails and we move on.
fn own_container_network() -> Result<Option<String>> {
    let Ok(hostname) = std::env::var("HOSTNAME") else {
        return Ok(None);
    };
    if hostname.is_empty() {
        return Ok(None);
    }
    let out = run(&[
        "inspect",
        "--format",
        "{{range $k, $v := .NetworkSettings.Networks}}{{$k}}{{end}}",
        &hostname,
    ])?;
    if !out.success {
        return Ok(None);
    }
    let name = out.stdout.trim().to_string();
    Ok(if name.is_empty() { None } else { Some(name) })
}

/// First existing network whose name contains the fragment.
fn find_by_fragment(fragment: &str) -> Result<Option<String>> {
    let out = run(&["network", "ls", "--format", "{{.Name}}"])?;
    if !out.success {
        bail!("network ls failed: {}", out.stderr.trim());
    }
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .find(|n| n.contains(fragment))
        .map(str::to_string))
}

/// Create the tenant network if it doesn't exist.
pub fn ensure_network(name: &str) -> Result<()> {
    let out = run(&["network", "inspect", name])?;
    if out.success {
        return Ok(());
    }

    let out = run(&["network", "create", "--driver", "bridge", name])?;
    if !out.success {
        bail!("network create failed: {}", out.stderr.trim());
    }

    tracing::info!("Created Docker network: {}", name);
    Ok(())
}
