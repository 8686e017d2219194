// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Accepts TCP connections and tunnels each one through its own session.
//! Grounded on `original_source/client/driver_listener.c`'s accept loop and
//! per-client forwarding, but replaces its intrusive `client_entry_t` linked
//! list with an explicit `session_id -> client handle` map (`spec.md` §9's
//! design note), modeled on the teacher's `client::pool_sessions::Pool`
//! (`DashMap` keyed by session identifier).

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

use crate::event_loop::{CoreEvent, CoreRequest};

const READ_CHUNK: usize = 4096;

/// Inbound-to-client channel: the dispatch loop below pushes DATA_IN bytes
/// here; dropping the sender (on SESSION_CLOSED) is the signal for the
/// client task to stop.
type ClientMap = Arc<DashMap<u16, mpsc::UnboundedSender<Bytes>>>;

/// Runs the TCP listener driver to completion. Every accepted connection
/// requests its own session (tunneled to `tunnel_target`, shared by every
/// client); the driver exits when the CORE shuts down.
pub async fn run(
    listener: TcpListener,
    tunnel_target: Option<(String, u16)>,
    requests: mpsc::UnboundedSender<CoreRequest>,
    mut events: mpsc::UnboundedReceiver<CoreEvent>,
) -> anyhow::Result<()> {
    let clients: ClientMap = Arc::new(DashMap::new());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                info!(%peer, "tcp_listener accepted connection");
                spawn_client(socket, tunnel_target.clone(), requests.clone(), clients.clone());
            }

            event = events.recv() => {
                match event {
                    Some(CoreEvent::DataIn { session_id, bytes }) => {
                        if let Some(tx) = clients.get(&session_id) {
                            let _ = tx.send(bytes);
                        }
                    }
                    Some(CoreEvent::SessionClosed { session_id }) => {
                        clients.remove(&session_id);
                    }
                    Some(CoreEvent::Shutdown) | None => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

fn spawn_client(
    mut socket: TcpStream,
    tunnel_target: Option<(String, u16)>,
    requests: mpsc::UnboundedSender<CoreRequest>,
    clients: ClientMap,
) {
    tokio::spawn(async move {
        let (reply_tx, reply_rx) = oneshot::channel();
        if requests
            .send(CoreRequest::CreateSession {
                tunnel: tunnel_target,
                reply: reply_tx,
            })
            .is_err()
        {
            return;
        }
        let session_id = match reply_rx.await {
            Ok(id) => id,
            Err(_) => return,
        };

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Bytes>();
        clients.insert(session_id, inbound_tx);

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                read = socket.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => {
                            let _ = requests.send(CoreRequest::CloseSession { session_id });
                            clients.remove(&session_id);
                            return;
                        }
                        Ok(n) => {
                            if requests.send(CoreRequest::DataOut {
                                session_id,
                                bytes: Bytes::copy_from_slice(&buf[..n]),
                            }).is_err() {
                                return;
                            }
                        }
                    }
                }

                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(bytes) => {
                            if socket.write_all(&bytes).await.is_err() {
                                let _ = requests.send(CoreRequest::CloseSession { session_id });
                                clients.remove(&session_id);
                                return;
                            }
                        }
                        None => {
                            warn!(session_id, "tcp_listener session closed by CORE");
                            return;
                        }
                    }
                }
            }
        }
    });
}
