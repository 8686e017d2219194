// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pipes a child process's stdout/stderr out over the tunnel and the
//! tunnel's inbound data into the child's stdin. Recovers `driver_exec`
//! (named in `original_source/client/dnscat.c`'s CLI help but not present
//! among the kept original-source files) in `tokio::process`'s idiom.

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::{mpsc, oneshot},
};
use tracing::info;

use crate::event_loop::{CoreEvent, CoreRequest};

const READ_CHUNK: usize = 4096;

/// Runs the exec driver to completion: creates one session, spawns `command`,
/// and forwards bytes in both directions until the child exits or the CORE
/// signals shutdown.
pub async fn run(
    command: String,
    tunnel: Option<(String, u16)>,
    requests: mpsc::UnboundedSender<CoreRequest>,
    mut events: mpsc::UnboundedReceiver<CoreEvent>,
) -> anyhow::Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    requests.send(CoreRequest::CreateSession {
        tunnel,
        reply: reply_tx,
    })?;
    let session_id = reply_rx.await?;
    info!(session_id, %command, "exec driver session established");

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let mut child_stdin = child.stdin.take().expect("stdin was piped");
    let mut child_stdout = child.stdout.take().expect("stdout was piped");
    let mut child_stderr = child.stderr.take().expect("stderr was piped");

    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    // EOF on one pipe doesn't mean the child exited (it may still hold the
    // other open); stop polling that handle rather than spinning on an
    // immediately-ready EOF read.
    let mut stdout_open = true;
    let mut stderr_open = true;

    let finish = |requests: &mpsc::UnboundedSender<CoreRequest>| {
        let _ = requests.send(CoreRequest::CloseSession { session_id });
        let _ = requests.send(CoreRequest::Shutdown);
    };

    loop {
        tokio::select! {
            status = child.wait() => {
                info!(?status, "exec driver child exited");
                finish(&requests);
                return Ok(());
            }

            read = child_stdout.read(&mut out_buf), if stdout_open => {
                match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => requests.send(CoreRequest::DataOut {
                        session_id,
                        bytes: Bytes::copy_from_slice(&out_buf[..n]),
                    })?,
                    Err(e) => return Err(e.into()),
                }
            }

            read = child_stderr.read(&mut err_buf), if stderr_open => {
                match read {
                    Ok(0) => stderr_open = false,
                    Ok(n) => requests.send(CoreRequest::DataOut {
                        session_id,
                        bytes: Bytes::copy_from_slice(&err_buf[..n]),
                    })?,
                    Err(e) => return Err(e.into()),
                }
            }

            event = events.recv() => {
                match event {
                    Some(CoreEvent::DataIn { session_id: sid, bytes }) if sid == session_id => {
                        child_stdin.write_all(&bytes).await?;
                    }
                    Some(CoreEvent::SessionClosed { session_id: sid }) if sid == session_id => {
                        let _ = child.kill().await;
                        return Ok(());
                    }
                    Some(CoreEvent::Shutdown) | None => {
                        let _ = child.kill().await;
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}
