use std::time::{Duration, Instant};

use crate::runtime::ContainerRuntime;

/// Poll a container until its shell answers, or the timeout lapses.
///
/// Advisory only: a `false` result is reported as a warning by callers, never
/// as a provisioning failure. Runs on a blocking job thread, hence the plain
/// thread sleep.
pub fn await_ready(
    rt: &dyn ContainerRuntime,
    container: &str,
    user: &str,
    timeout: Duration,
    poll: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match rt.exec(container, user, poll.as_secs().max(1) * 5, "echo ready") {
            Ok(out) if out.ok() && out.output.contains("ready") => return true,
            Ok(_) | Err(_) => {}
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(poll);
    }
}
