//! Dev-server / build process probe.
//!
//! Spawns the configured command in its own process group, scans its output
//! for a ready marker, and always tears the group down before returning,
//! whichever way the wait resolved.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{Probe, ProbeContext, ProbeError, ProbeKind};
use crate::config::{DevServerProbeConfig, EnvFlag};

/// How long a signalled process group gets before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How long to keep reading buffered output after the process exits.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How the wait for a ready marker resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// A marker appeared on this output line.
    Ready { line: String },
    /// No marker before the deadline.
    TimedOut,
    /// The process exited without printing a marker.
    ExitedEarly { code: Option<i32> },
}

/// Spawn `command`, wait for readiness, then terminate the process group.
///
/// Returns the readiness outcome and the pid of the spawned process.
pub async fn run_until_ready(
    command: &[String],
    workdir: &Path,
    markers: &[String],
    timeout: Duration,
) -> Result<(Readiness, Option<u32>), ProbeError> {
    let command_line = command.join(" ");
    let (program, args) = command.split_first().ok_or_else(|| ProbeError::Spawn {
        command: command_line.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| ProbeError::Spawn {
        command: command_line.clone(),
        source,
    })?;
    let pid = child.id();
    info!(command = %command_line, pid = ?pid, timeout_ms = timeout.as_millis() as u64, "spawned probe process");

    let readiness = wait_for_ready(&mut child, markers, timeout).await;
    debug!(pid = ?pid, outcome = ?readiness, "probe process resolved");

    terminate_group(&mut child, pid).await;
    Ok((readiness, pid))
}

async fn wait_for_ready(child: &mut Child, markers: &[String], timeout: Duration) -> Readiness {
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Readiness::TimedOut,

            line = next_line(&mut stdout) => match line {
                Some(line) if is_ready(&line, markers) => return Readiness::Ready { line },
                Some(_) => {}
                None => stdout = None,
            },

            line = next_line(&mut stderr) => match line {
                Some(line) if is_ready(&line, markers) => return Readiness::Ready { line },
                Some(_) => {}
                None => stderr = None,
            },

            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                // Output written just before exit may still be buffered.
                let drained = tokio::time::timeout(
                    DRAIN_GRACE,
                    drain_for_marker(&mut stdout, &mut stderr, markers),
                )
                .await
                .ok()
                .flatten();
                return match drained {
                    Some(line) => Readiness::Ready { line },
                    None => Readiness::ExitedEarly { code },
                };
            }
        }
    }
}

fn is_ready(line: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| line.contains(m.as_str()))
}

async fn next_line<R: AsyncRead + Unpin>(lines: &mut Option<Lines<BufReader<R>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

async fn drain_for_marker<A, B>(
    stdout: &mut Option<Lines<BufReader<A>>>,
    stderr: &mut Option<Lines<BufReader<B>>>,
    markers: &[String],
) -> Option<String>
where
    A: AsyncRead + Unpin,
    B: AsyncRead + Unpin,
{
    if let Some(lines) = stdout {
        while let Ok(Some(line)) = lines.next_line().await {
            if is_ready(&line, markers) {
                return Some(line);
            }
        }
    }
    if let Some(lines) = stderr {
        while let Ok(Some(line)) = lines.next_line().await {
            if is_ready(&line, markers) {
                return Some(line);
            }
        }
    }
    None
}

/// Terminate the spawned process and everything in its process group.
///
/// Sends SIGTERM to the group first, waits up to [`TERM_GRACE`], then
/// SIGKILLs the group and the child.
async fn terminate_group(child: &mut Child, pid: Option<u32>) {
    signal_group(pid, Signal::Term);

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "probe process exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for probe process after SIGTERM");
        }
        Err(_) => {
            warn!("probe process did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL probe process");
            }
        }
    }

    // Grandchildren (e.g. the server started by `npm run dev`) share the group.
    signal_group(pid, Signal::Kill);
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // A negative pid addresses the whole group; ESRCH once it is gone is fine.
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

/// Probe wrapping [`run_until_ready`].
pub struct DevServerProbe {
    workdir: PathBuf,
    spec: DevServerProbeConfig,
}

impl DevServerProbe {
    pub fn new(spec: &DevServerProbeConfig, ctx: &ProbeContext) -> Self {
        Self {
            workdir: ctx.workdir.clone(),
            spec: spec.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Probe for DevServerProbe {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> ProbeKind {
        ProbeKind::Process
    }

    fn flag(&self) -> Option<EnvFlag> {
        self.spec.flag
    }

    async fn check(&self) -> Result<String, ProbeError> {
        let timeout = Duration::from_millis(self.spec.timeout_ms);
        let start = Instant::now();
        let (readiness, _pid) = run_until_ready(
            &self.spec.command,
            &self.workdir,
            &self.spec.ready_markers,
            timeout,
        )
        .await?;

        match readiness {
            Readiness::Ready { line } => Ok(format!(
                "ready after {}ms: {}",
                start.elapsed().as_millis(),
                line.trim()
            )),
            Readiness::TimedOut => Err(ProbeError::Timeout(timeout)),
            Readiness::ExitedEarly { code } => Err(ProbeError::ExitedEarly { code }),
        }
    }
}
