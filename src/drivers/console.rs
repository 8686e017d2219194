// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Forwards raw bytes between stdin/stdout and a single tunnel session.
//! Grounded on `original_source/client/driver_console.c`: `console_stdin_recv`
//! posts `DATA_OUT` for every chunk read, `handle_data_in` writes straight to
//! stdout, and stdin EOF is the signal to shut the whole process down.

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, stdin, stdout},
    sync::{mpsc, oneshot},
};
use tracing::info;

use crate::event_loop::{CoreEvent, CoreRequest};

const READ_CHUNK: usize = 4096;

/// Runs the console driver to completion: creates one session (tunneled, if
/// `tunnel` is given), then pumps stdin -> DATA_OUT and DATA_IN -> stdout
/// until stdin closes or the CORE signals shutdown.
pub async fn run(
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
    info!(session_id, "console driver session established");

    let mut stdin = stdin();
    let mut stdout = stdout();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = stdin.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let _ = requests.send(CoreRequest::CloseSession { session_id });
                        let _ = requests.send(CoreRequest::Shutdown);
                        return Ok(());
                    }
                    Ok(n) => {
                        requests.send(CoreRequest::DataOut {
                            session_id,
                            bytes: Bytes::copy_from_slice(&buf[..n]),
                        })?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            event = events.recv() => {
                match event {
                    Some(CoreEvent::DataIn { session_id: sid, bytes }) if sid == session_id => {
                        stdout.write_all(&bytes).await?;
                        stdout.flush().await?;
                    }
                    Some(CoreEvent::SessionClosed { session_id: sid }) if sid == session_id => {
                        return Ok(());
                    }
                    Some(CoreEvent::Shutdown) | None => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}
