//! Connector sub-process supervision.
//!
//! `run` launches an external command, feeds its stdin from a caller-supplied
//! producer, pumps its stdout into a [`RecordSink`], captures a bounded prefix
//! of stderr, and propagates the first error observed by any of the workers.
//! Cancellation delivers SIGTERM; the launched executable (a container runtime
//! wrapper, when used for containers) owns escalation from there.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::first_error::FirstError;
use super::framing::RecordSink;
use super::stderr::BoundedStderr;

/// Launch `argv` and supervise it to completion.
///
/// * `stdin_producer` receives the child's stdin pipe; stdin is closed when
///   the producer returns.
/// * `stdout_sink` receives the raw stdout byte stream; a sink error cancels
///   the child. The sink is closed after the child exits.
/// * Cancelling `cancel` sends SIGTERM to the child and the run resolves with
///   whatever error was first observed.
///
/// A non-zero exit becomes an error carrying the captured stderr prefix.
pub async fn run<P, Fut, S>(
    cancel: &CancellationToken,
    argv: &[String],
    stdin_producer: P,
    stdout_sink: S,
) -> anyhow::Result<()>
where
    P: FnOnce(ChildStdin) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: RecordSink + 'static,
{
    if cancel.is_cancelled() {
        bail!("invocation cancelled before start");
    }
    let Some((program, args)) = argv.split_first() else {
        bail!("empty argv");
    };

    // Child scope: an error on any worker cancels the others and the child,
    // while a caller-side cancel propagates in.
    let scope = cancel.child_token();
    let errors = Arc::new(FirstError::new());

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning connector {program:?}"))?;
    debug!(program = %program, pid = child.id(), "spawned connector");

    let stdin = child.stdin.take().expect("stdin is piped");
    let stdout = child.stdout.take().expect("stdout is piped");
    let child_stderr = child.stderr.take().expect("stderr is piped");
    let pid = child.id();

    let stdin_task = tokio::spawn({
        let scope = scope.clone();
        let errors = Arc::clone(&errors);
        async move {
            if let Err(err) = stdin_producer(stdin).await {
                errors.observe(err.context("feeding connector stdin"));
                scope.cancel();
            }
            // stdin dropped here, closing the pipe.
        }
    });

    let stdout_task = tokio::spawn({
        let scope = scope.clone();
        let errors = Arc::clone(&errors);
        let mut sink = stdout_sink;
        let mut stdout = stdout;
        async move {
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(err) = sink.write(&buf[..n]) {
                            errors.observe(err.context("connector output"));
                            scope.cancel();
                            break;
                        }
                    }
                    Err(err) => {
                        errors.observe(
                            anyhow::Error::from(err).context("reading connector stdout"),
                        );
                        scope.cancel();
                        break;
                    }
                }
            }
            sink
        }
    });

    let captured = Arc::new(Mutex::new(BoundedStderr::default()));
    let stderr_task = tokio::spawn({
        let captured = Arc::clone(&captured);
        async move {
            let mut stderr = child_stderr;
            let mut buf = vec![0u8; 8 * 1024];
            while let Ok(n) = stderr.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                captured.lock().write(&buf[..n]);
            }
        }
    });

    // Deliver SIGTERM on cancellation. The child is responsible for its own
    // graceful-shutdown escalation; no SIGKILL from here.
    let terminator = tokio::spawn({
        let scope = scope.clone();
        async move {
            scope.cancelled().await;
            if let Some(pid) = pid {
                if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid, error = %err, "failed to signal connector");
                }
            }
        }
    });

    let status = child.wait().await;
    terminator.abort();

    let _ = stdin_task.await;
    let _ = stderr_task.await;
    let mut sink = stdout_task.await.context("joining stdout worker")?;

    match status {
        Ok(status) if status.success() => {}
        Ok(status) => {
            let snippet = captured.lock().snapshot();
            errors.observe(anyhow::anyhow!(
                "connector failed ({status}) with stderr:\n{snippet}"
            ));
        }
        Err(err) => {
            errors.observe(anyhow::Error::from(err).context("waiting on connector"));
        }
    }

    errors.observe_result(sink.close());

    match errors.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
