//! Step subprocesses: script files, process groups and the kill path.

use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const KILL_ATTEMPTS: usize = 5;
const KILL_GRACE: Duration = Duration::from_secs(1);

/// The text bash runs for a step: exported environment, then the prestep
/// sources, then the script itself.
pub fn render_script(env: &[(String, String)], sources: &str, script: &str) -> String {
    let mut text = String::from("#!/bin/bash\n\n");
    for (name, value) in env {
        text.push_str(&format!("export {}={}\n", name, shell_quote(value)));
    }
    text.push('\n');
    text.push_str(sources);
    text.push('\n');
    text.push_str(script);
    text.push('\n');
    text
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Write the step script to a temporary file that lives as long as the
/// returned handle.
pub fn write_script(
    env: &[(String, String)],
    sources: &str,
    script: &str,
) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("conveyor-step-")
        .suffix(".sh")
        .tempfile()?;
    file.write_all(render_script(env, sources, script).as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Run `script` with bash in its own process group.
pub fn spawn(script: &Path, cwd: &Path) -> std::io::Result<Child> {
    let mut command = std::process::Command::new("/bin/bash");
    command
        .arg(script)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    Command::from(command).kill_on_drop(true).spawn()
}

/// Forward stdout and stderr lines to one channel in arrival order.
///
/// The channel closes when both streams reach end of file, which can be
/// after the child itself exits if it left descendants behind.
pub fn merge_output(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx));
    }
    rx
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&line).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream closed");
                break;
            }
        }
    }
}

/// Exit code as the server expects it; death by signal N reports -N.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(1)
}

fn has_exited(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(Some(_)))
}

/// Terminate the step's whole process group.
///
/// SIGTERM goes to the group up to five times, a second apart, before
/// SIGKILL. Failure to kill is only logged.
pub async fn kill_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    let mut exited = false;
    for _ in 0..KILL_ATTEMPTS {
        info!(pgid = pid, "Sending SIGTERM to process group");
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            warn!(pgid = pid, error = %e, "Could not signal process group");
            break;
        }
        tokio::time::sleep(KILL_GRACE).await;
        if has_exited(child) {
            exited = true;
            break;
        }
    }

    if !exited {
        warn!(pid, "Trying to forcefully kill");
        let _ = killpg(pgid, Signal::SIGKILL);
        let _ = child.start_kill();
        exited = matches!(
            tokio::time::timeout(KILL_GRACE, child.wait()).await,
            Ok(Ok(_))
        );
    }

    // Leftover group members would keep the output pipes open.
    let _ = killpg(pgid, Signal::SIGKILL);

    if exited {
        info!(pid, "Step process killed as requested");
    } else {
        warn!(pid, "Unable to kill step process");
    }
}

/// Kill whatever the step left running in its group after the leader
/// exited.
pub fn reap_group(pid: u32) {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => info!(pgid = pid, "Killed leftover step processes"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, error = %e, "Could not signal process group"),
    }
}
