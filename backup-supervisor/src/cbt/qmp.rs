//! Scripted QMP session that asks the storage daemon to format an overlay.
//!
//! The two setup commands are written up front; the session then reads the
//! monitor line by line until the `create` job concludes, queries the job
//! result, dismisses it and quits the daemon.

use crate::utils::{Result, SupervisorError};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

const JOB_ID: &str = "create";

/// Node names the storage daemon is started with
pub const OVERLAY_NODE: &str = "overlay";
pub const DATA_NODE: &str = "data";

fn overlay_error(message: String) -> SupervisorError {
    SupervisorError::Io(std::io::Error::other(message))
}

async fn send<W: AsyncWrite + Unpin>(stdin: &mut W, command: Value) -> Result<()> {
    let mut line = serde_json::to_string(&command)?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

fn is_job_concluded(message: &Value) -> bool {
    message["event"] == "JOB_STATUS_CHANGE"
        && message["data"]["id"] == JOB_ID
        && message["data"]["status"] == "concluded"
}

/// Error reported for our job in a `query-jobs` reply
fn job_error(message: &Value) -> Option<String> {
    message["return"]
        .as_array()?
        .iter()
        .find(|job| job["id"] == JOB_ID)?
        .get("error")?
        .as_str()
        .map(str::to_string)
}

/// Drive the overlay creation and return the monitor transcript.
pub async fn run_overlay_qmp_session<W, R>(
    stdin: W,
    stdout: R,
    size: u64,
    overlay_path: &Path,
    timeout: Duration,
) -> Result<String>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, session(stdin, stdout, size, overlay_path)).await {
        Ok(result) => result,
        Err(_) => Err(SupervisorError::Timeout(format!(
            "overlay creation timed out after {:?} for {}",
            timeout,
            overlay_path.display()
        ))),
    }
}

async fn session<W, R>(mut stdin: W, stdout: R, size: u64, overlay_path: &Path) -> Result<String>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    send(&mut stdin, json!({"execute": "qmp_capabilities"})).await?;
    send(
        &mut stdin,
        json!({
            "execute": "blockdev-create",
            "arguments": {
                "job-id": JOB_ID,
                "options": {
                    "driver": "qcow2",
                    "file": OVERLAY_NODE,
                    "data-file": DATA_NODE,
                    "data-file-raw": true,
                    "size": size,
                }
            }
        }),
    )
    .await?;

    let mut lines = BufReader::new(stdout).lines();
    let mut transcript = Vec::new();
    let mut concluded = false;
    let mut failure = None;

    while let Some(line) = lines.next_line().await? {
        debug!("qmp: {}", line);
        let message: Option<Value> = serde_json::from_str(&line).ok();
        transcript.push(line);
        let Some(message) = message else {
            continue;
        };

        if !concluded && is_job_concluded(&message) {
            concluded = true;
            send(&mut stdin, json!({"execute": "query-jobs"})).await?;
            send(&mut stdin, json!({"execute": "job-dismiss", "arguments": {"id": JOB_ID}})).await?;
            send(&mut stdin, json!({"execute": "quit"})).await?;
            continue;
        }
        if concluded && failure.is_none() {
            failure = job_error(&message);
        }
    }

    let transcript = transcript.join("\n");
    if !concluded {
        return Err(overlay_error(format!(
            "storage daemon exited without job concluding for {}: {}",
            overlay_path.display(),
            transcript
        )));
    }
    if let Some(reason) = failure {
        return Err(overlay_error(format!(
            "blockdev-create job failed for {}: {}",
            overlay_path.display(),
            reason
        )));
    }
    Ok(transcript)
}
