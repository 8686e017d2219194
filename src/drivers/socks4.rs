// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A CONNECT-only SOCKS4/SOCKS4a proxy. Each client negotiates its own
//! tunnel target; SOCKS4 command parsing beyond `CONNECT` is out of scope
//! (`spec.md` §1), so anything else is rejected and the connection closed
//! without ever creating a session.

use std::{net::Ipv4Addr, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

use crate::{
    error::TunnelError,
    event_loop::{CoreEvent, CoreRequest},
};

const READ_CHUNK: usize = 4096;
const SOCKS4_CONNECT: u8 = 0x01;
const SOCKS4_REPLY_GRANTED: u8 = 0x5A;
const SOCKS4_REPLY_REJECTED: u8 = 0x5B;

type ClientMap = Arc<DashMap<u16, mpsc::UnboundedSender<Bytes>>>;

/// Runs the SOCKS4 driver to completion, accepting connections on `listener`
/// until the CORE shuts down.
pub async fn run(
    listener: TcpListener,
    requests: mpsc::UnboundedSender<CoreRequest>,
    mut events: mpsc::UnboundedReceiver<CoreEvent>,
) -> anyhow::Result<()> {
    let clients: ClientMap = Arc::new(DashMap::new());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                info!(%peer, "socks4 driver accepted connection");
                spawn_client(socket, requests.clone(), clients.clone());
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

/// A parsed `CONNECT` request: the target host (a dotted IP, or a name for
/// the SOCKS4a "invalid IP, hostname follows the userid" variant) and port.
struct ConnectRequest {
    host: String,
    port: u16,
}

async fn read_connect_request(socket: &mut TcpStream) -> Result<ConnectRequest, TunnelError> {
    let mut head = [0u8; 8];
    socket
        .read_exact(&mut head)
        .await
        .map_err(|_| TunnelError::Transient("socks4 request truncated".into()))?;

    let version = head[0];
    let command = head[1];
    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);

    if version != 4 || command != SOCKS4_CONNECT {
        return Err(TunnelError::ProtocolViolation(format!(
            "unsupported socks4 request: version={version} command={command}"
        )));
    }

    read_nul_terminated(socket).await?; // userid, discarded

    let is_socks4a = ip.octets()[0..3] == [0, 0, 0] && ip.octets()[3] != 0;
    let host = if is_socks4a {
        String::from_utf8(read_nul_terminated(socket).await?)
            .map_err(|_| TunnelError::Transient("socks4a hostname is not utf-8".into()))?
    } else {
        ip.to_string()
    };

    Ok(ConnectRequest { host, port })
}

async fn read_nul_terminated(socket: &mut TcpStream) -> Result<Vec<u8>, TunnelError> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket
            .read_exact(&mut byte)
            .await
            .map_err(|_| TunnelError::Transient("socks4 field truncated".into()))?;
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
        if out.len() > 255 {
            return Err(TunnelError::ProtocolViolation(
                "socks4 field too long".into(),
            ));
        }
    }
}

fn spawn_client(
    mut socket: TcpStream,
    requests: mpsc::UnboundedSender<CoreRequest>,
    clients: ClientMap,
) {
    tokio::spawn(async move {
        let request = match read_connect_request(&mut socket).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "rejecting socks4 client");
                let _ = socket
                    .write_all(&[0, SOCKS4_REPLY_REJECTED, 0, 0, 0, 0, 0, 0])
                    .await;
                return;
            },
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if requests
            .send(CoreRequest::CreateSession {
                tunnel: Some((request.host.clone(), request.port)),
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

        if socket
            .write_all(&[0, SOCKS4_REPLY_GRANTED, 0, 0, 0, 0, 0, 0])
            .await
            .is_err()
        {
            let _ = requests.send(CoreRequest::CloseSession { session_id });
            return;
        }

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
                        None => return,
                    }
                }
            }
        }
    });
}
