pub mod network;

use std::process::Command;

/// Classified failure from the container runtime control plane.
///
/// The split matters because each kind drives a different recovery path in the
/// state machine: conflicts are retried once, communication faults get a
/// follow-up existence check, not-found is sometimes already-satisfied.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Fault {
    #[error("name conflict: {0}")]
    Conflict(String),
    #[error("port in use: {0}")]
    PortInUse(String),
    #[error("communication failure: {0}")]
    Communication(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("image missing: {0}")]
    ImageMissing(String),
    #[error("{0}")]
    Other(String),
}

impl Fault {
    pub fn is_communication(&self) -> bool {
        matches!(self, Fault::Communication(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Fault::NotFound(_))
    }
}

/// Classify engine stderr into a [`Fault`].
///
/// The engine reports port binds as 500s with "port is already allocated",
/// name collisions as 409 Conflict, and a truncated/empty response when the
/// transport drops mid-operation even though the daemon finished the work.
pub fn classify(stderr: &str) -> Fault {
    let text = stderr.trim();
    let lower = text.to_lowercase();

    if lower.contains("no such container") || lower.contains("no such object") {
        return Fault::NotFound(text.to_string());
    }
    if lower.contains("no such image") || lower.contains("unable to find image") {
        return Fault::ImageMissing(text.to_string());
    }
    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return Fault::PortInUse(text.to_string());
    }
    if lower.contains("conflict") || lower.contains("already in use") {
        return Fault::Conflict(text.to_string());
    }
    if text.is_empty()
        || lower.contains("connection aborted")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("unexpected eof")
        || lower.contains("error during connect")
    {
        return Fault::Communication(if text.is_empty() {
            "empty response from container engine".to_string()
        } else {
            text.to_string()
        });
    }
    Fault::Other(text.to_string())
}

/// Container creation parameters. One struct rather than a parameter list so
/// the create/retry path can reuse it with only the port swapped.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    /// Host port published to the container's service port.
    pub host_port: u16,
    /// Service port inside the container.
    pub container_port: u16,
    pub env: Vec<(String, String)>,
}

/// Snapshot of a container's identity and run state.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub id: String,
    pub running: bool,
}

/// Result of an in-container command: exit code plus captured output,
/// reported for every invocation, success or not.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub code: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.code == 0
    }
}

/// Capability set over the container engine's control plane.
///
/// The orchestrator, prober and installer program against this trait; the
/// scripted fakes in their tests stand in for a live daemon.
pub trait ContainerRuntime: Send + Sync {
    /// Engine reachability check.
    fn ping(&self) -> bool;
    /// Is the image present locally? Absence is fatal to provisioning.
    fn image_exists(&self, image: &str) -> Result<bool, Fault>;
    /// Create a container without starting it. Returns the engine-assigned id.
    fn create_container(&self, spec: &ContainerSpec) -> Result<String, Fault>;
    fn start_container(&self, name: &str) -> Result<(), Fault>;
    fn stop_container(&self, name: &str) -> Result<(), Fault>;
    fn restart_container(&self, name: &str) -> Result<(), Fault>;
    /// Force-remove a container. Absence is not an error.
    fn remove_container(&self, name: &str) -> Result<(), Fault>;
    /// Fresh id/run-state lookup by name. `Ok(None)` means no such container.
    fn inspect(&self, name: &str) -> Result<Option<ContainerState>, Fault>;
    /// Host port published for the container's service port, if any.
    fn published_port(&self, name: &str) -> Result<Option<u16>, Fault>;
    /// All host ports currently bound by any container, running or not.
    fn host_ports(&self) -> Result<Vec<u16>, Fault>;
    /// Run a shell command inside a container with a per-command timeout.
    fn exec(&self, name: &str, user: &str, timeout_secs: u64, script: &str)
        -> Result<ExecOutput, Fault>;
    /// `docker cp` style copy; either side may be `container:path`.
    fn copy(&self, src: &str, dst: &str) -> Result<(), Fault>;
    /// Best-effort removal of volumes whose name matches a prefix.
    fn remove_volumes(&self, prefix: &str) -> Result<(), Fault>;
    fn logs(&self, name: &str, tail: u32) -> Result<String, Fault>;
}

// ---------------------------------------------------------------------------
// Docker CLI implementation
// ---------------------------------------------------------------------------

pub struct DockerCli;

struct CliOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

impl DockerCli {
    fn run(args: &[&str]) -> Result<CliOutput, Fault> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .map_err(|e| Fault::Communication(format!("failed to invoke docker: {}", e)))?;
        Ok(CliOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        })
    }
}

impl ContainerRuntime for DockerCli {
    fn ping(&self) -> bool {
        Self::run(&["info", "--format", "{{.ServerVersion}}"])
            .map(|o| o.success)
            .unwrap_or(false)
    }

    fn image_exists(&self, image: &str) -> Result<bool, Fault> {
        let out = Self::run(&["image", "inspect", image, "--format", "{{.Id}}"])?;
        if out.success {
            return Ok(true);
        }
        match classify(&out.stderr) {
            Fault::NotFound(_) | Fault::ImageMissing(_) => Ok(false),
            fault => Err(fault),
        }
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String, Fault> {
        let port_flag = format!("{}:{}", spec.host_port, spec.container_port);
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            spec.network.clone(),
            "--restart".to_string(),
            "always".to_string(),
            "-p".to_string(),
            port_flag,
        ];
        for (k, v) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = Self::run(&arg_refs)?;
        if !out.success {
            return Err(classify(&out.stderr));
        }
        let id = out.stdout.trim().to_string();
        if id.is_empty() {
            // Engine acknowledged but returned nothing usable; the container
            // may still exist. Callers must reconcile by name.
            return Err(Fault::Communication(
                "create returned empty container id".to_string(),
            ));
        }
        Ok(id)
    }

    fn start_container(&self, name: &str) -> Result<(), Fault> {
        let out = Self::run(&["start", name])?;
        if !out.success {
            return Err(classify(&out.stderr));
        }
        Ok(())
    }

    fn stop_container(&self, name: &str) -> Result<(), Fault> {
        let out = Self::run(&["stop", "-t", "10", name])?;
        if !out.success {
            return Err(classify(&out.stderr));
        }
        Ok(())
    }

    fn restart_container(&self, name: &str) -> Result<(), Fault> {
        let out = Self::run(&["restart", "-t", "10", name])?;
        if !out.success {
            return Err(classify(&out.stderr));
        }
        Ok(())
    }

    fn remove_container(&self, name: &str) -> Result<(), Fault> {
        let out = Self::run(&["rm", "-f", name])?;
        if !out.success {
            match classify(&out.stderr) {
                Fault::NotFound(_) => return Ok(()),
                fault => return Err(fault),
            }
        }
        Ok(())
    }

    fn inspect(&self, name: &str) -> Result<Option<ContainerState>, Fault> {
        let out = Self::run(&[
            "inspect",
            "--format",
            "{{.Id}} {{.State.Running}}",
            name,
        ])?;
        if !out.success {
            match classify(&out.stderr) {
                Fault::NotFound(_) => return Ok(None),
                fault => return Err(fault),
            }
        }
        let text = out.stdout.trim();
        let mut parts = text.split_whitespace();
        let id = parts
            .next()
            .ok_or_else(|| Fault::Communication("empty inspect output".to_string()))?
            .to_string();
        let running = parts.next() == Some("true");
        Ok(Some(ContainerState { id, running }))
    }

    fn published_port(&self, name: &str) -> Result<Option<u16>, Fault> {
        let out = Self::run(&["port", name])?;
        if !out.success {
            match classify(&out.stderr) {
                Fault::NotFound(_) => return Ok(None),
                fault => return Err(fault),
            }
        }
        Ok(parse_first_host_port(&out.stdout))
    }

    fn host_ports(&self) -> Result<Vec<u16>, Fault> {
        let out = Self::run(&["ps", "-a", "--format", "{{.Ports}}"])?;
        if !out.success {
            return Err(classify(&out.stderr));
        }
        Ok(parse_host_ports(&out.stdout))
    }

    fn exec(
        &self,
        name: &str,
        user: &str,
        timeout_secs: u64,
        script: &str,
    ) -> Result<ExecOutput, Fault> {
        let timeout = timeout_secs.to_string();
        let args = [
            "exec", "-u", user, name, "timeout", &timeout, "bash", "-lc", script,
        ];
        let output = Command::new("docker")
            .args(args)
            .output()
            .map_err(|e| Fault::Communication(format!("failed to invoke docker exec: {}", e)))?;

        // "No such container" on exec is a daemon-side lookup failure, not a
        // non-zero command exit.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && stderr.to_lowercase().contains("no such container") {
            return Err(Fault::NotFound(stderr.trim().to_string()));
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&stderr);
        Ok(ExecOutput {
            code: output.status.code().unwrap_or(-1),
            output: combined.trim().to_string(),
        })
    }

    fn copy(&self, src: &str, dst: &str) -> Result<(), Fault> {
        let out = Self::run(&["cp", src, dst])?;
        if !out.success {
            return Err(classify(&out.stderr));
        }
        Ok(())
    }

    fn remove_volumes(&self, prefix: &str) -> Result<(), Fault> {
        let filter = format!("name={}", prefix);
        let out = Self::run(&["volume", "ls", "-q", "--filter", &filter])?;
        if !out.success {
            return Err(classify(&out.stderr));
        }
        for volume in out.stdout.lines().map(str::trim).filter(|v| !v.is_empty()) {
            let rm = Self::run(&["volume", "rm", volume])?;
            if !rm.success {
                tracing::warn!("failed to remove volume {}: {}", volume, rm.stderr.trim());
            }
        }
        Ok(())
    }

    fn logs(&self, name: &str, tail: u32) -> Result<String, Fault> {
        let tail_str = tail.to_string();
        let out = Self::run(&["logs", "--tail", &tail_str, name])?;
        Ok(format!("{}{}", out.stdout, out.stderr))
    }
}

/// Parse `docker port` output like `8000/tcp -> 0.0.0.0:8003` into the first
/// host port.
fn parse_first_host_port(output: &str) -> Option<u16> {
    for line in output.lines() {
        if let Some((_, addr)) = line.split_once("->") {
            if let Some((_, port)) = addr.trim().rsplit_once(':') {
                if let Ok(p) = port.trim().parse::<u16>() {
                    return Some(p);
                }
            }
        }
    }
    None
}

/// Parse `docker ps --format {{.Ports}}` lines like
/// `0.0.0.0:8003->8000/tcp, [::]:8003->8000/tcp` into host ports.
fn parse_host_ports(output: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for segment in output.split(|c| c == ',' || c == '\n') {
        let Some((bind, _)) = segment.split_once("->") else {
            continue;
        };
        if let Some((_, port)) = bind.trim().rsplit_once(':') {
            if let Ok(p) = port.trim().parse::<u16>() {
                if !ports.contains(&p) {
                    ports.push(p);
                }
            }
        }
    }
    ports
}
