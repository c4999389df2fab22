//! Post-completion hook (e.g. an antivirus scan). Never fatal.

use std::path::Path;
use std::process::Command;

/// Run `command` with the finished file's path appended as the last
/// argument. Any failure is logged and swallowed; the task stays completed.
pub fn run_completion_hook(command: &str, path: &Path) {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return;
    };
    let mut cmd = Command::new(program);
    cmd.args(parts).arg(path);
    match cmd.status() {
        Ok(status) if status.success() => {
            tracing::debug!(hook = command, path = %path.display(), "completion hook ok");
        }
        Ok(status) => {
            tracing::warn!(hook = command, %status, "completion hook exited nonzero");
        }
        Err(e) => {
            tracing::warn!(hook = command, error = %e, "completion hook failed to run");
        }
    }
}
