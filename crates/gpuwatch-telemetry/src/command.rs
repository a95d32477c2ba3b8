//! External command plumbing shared by the CLI-backed sources.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gpuwatch_types::{GpuWatchError, ProviderKind};
use tokio::process::Command;
use tokio::time::timeout;

/// Resolve `program` to an executable, reported as a construction failure.
///
/// Names containing a path separator are checked as-is; bare names are
/// searched for on `PATH`.  Files without execute permission do not count.
pub(crate) fn require_program(
    provider: ProviderKind,
    program: &Path,
) -> Result<PathBuf, GpuWatchError> {
    which::which(program).map_err(|e| GpuWatchError::BackendUnavailable {
        provider,
        reason: format!("{}: {e}", program.display()),
    })
}

/// Run `program` with `args` and return its stdout.
///
/// A spawn failure, a non-zero exit status, or exceeding `limit` is an
/// error.  The child is killed if the timeout fires.
pub(crate) async fn run(
    program: &Path,
    args: &[&str],
    limit: Duration,
) -> Result<String, GpuWatchError> {
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = timeout(limit, child)
        .await
        .map_err(|_| {
            GpuWatchError::Backend(format!(
                "{} timed out after {}ms",
                program.display(),
                limit.as_millis()
            ))
        })?
        .map_err(|e| GpuWatchError::Io(format!("{}: {e}", program.display())))?;

    if !output.status.success() {
        return Err(GpuWatchError::Backend(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
