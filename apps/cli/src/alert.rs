//! Out-of-band operator notification.
//!
//! The configured command runs through `sh -c` with the error report on
//! stdin (for example `mail -s "eventstream-router failed" ops@example.org`).
//! Notification is best effort: failures are logged and otherwise ignored.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::time::Duration;

use color_eyre::eyre::Result;
use futures::FutureExt;
use streamrouter_shared::panic_message;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Await `run`; an error or a panic escaping it is reported to `command`
/// before being passed on unchanged.
pub(crate) async fn on_failure<F>(run: F, command: Option<&str>) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let outcome = AssertUnwindSafe(run).catch_unwind().await;
    match (outcome, command) {
        (Ok(result), None) => result,
        (Ok(Ok(())), Some(_)) => Ok(()),
        (Ok(Err(e)), Some(command)) => {
            notify(command, &format!("{e:?}")).await;
            Err(e)
        }
        (Err(payload), command) => {
            let panic = panic_message(payload.as_ref());
            error!(%panic, "router panicked");
            if let Some(command) = command {
                notify(command, &format!("eventstream-router panicked: {panic}")).await;
            }
            std::panic::resume_unwind(payload)
        }
    }
}

pub(crate) async fn notify(command: &str, report: &str) {
    match tokio::time::timeout(NOTIFY_TIMEOUT, send(command, report)).await {
        Ok(Ok(status)) if status.success() => debug!("alert sent"),
        Ok(Ok(status)) => warn!(%status, "alert command exited unsuccessfully"),
        Ok(Err(e)) => warn!(error = %e, "could not run alert command"),
        Err(_) => warn!(timeout_secs = NOTIFY_TIMEOUT.as_secs(), "alert command timed out"),
    }
}

async fn send(command: &str, report: &str) -> std::io::Result<std::process::ExitStatus> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(report.as_bytes()).await?;
        // Dropping stdin closes the pipe so the command sees EOF.
    }
    child.wait().await
}
