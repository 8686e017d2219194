// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The single cooperative task that owns the bus, session layer, carrier
//! adapter, and heartbeat timer (`spec.md` §4.2, §5). Replaces the
//! callback-based C event loop with `tokio::select!`, per `spec.md` §9's
//! design note, while preserving the single-threaded cooperative contract:
//! every handler above runs to completion before the next branch fires.
//!
//! External input drivers run as their own tasks and talk to this one only
//! through the [`CoreRequest`]/[`CoreEvent`] channel pair — the concrete
//! shape of the input driver contract (`spec.md` §6).

use std::{net::SocketAddr, rc::Rc, time::Duration};

use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    bus::{Bus, Message, MessageKind},
    carrier::DnsCarrier,
    error::TunnelError,
    session::SessionLayer,
};

/// What an input driver asks of the CORE.
pub enum CoreRequest {
    CreateSession {
        tunnel: Option<(String, u16)>,
        reply: oneshot::Sender<u16>,
    },
    DataOut {
        session_id: u16,
        bytes: Bytes,
    },
    CloseSession {
        session_id: u16,
    },
    Shutdown,
}

/// What the CORE tells the active input driver.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    SessionCreated { session_id: u16 },
    DataIn { session_id: u16, bytes: Bytes },
    SessionClosed { session_id: u16 },
    Shutdown,
}

/// Configuration needed to start the event loop; deliberately narrow, per
/// `spec.md` §6's "the core only requires that the domain suffix, upstream
/// resolver host, and upstream port be provided before the loop starts."
pub struct EventLoopConfig {
    pub domain_suffix: String,
    pub upstream: SocketAddr,
    pub heartbeat_interval: Duration,
}

/// Runs the CORE until SHUTDOWN, `cancel` fires, or a carrier-fatal error.
/// `requests` is drained from whichever input driver task is active;
/// `events` is where SESSION_CREATED/DATA_IN/SESSION_CLOSED/SHUTDOWN are
/// forwarded to it. `cancel` is the external stop signal (e.g. Ctrl-C in
/// `main`), mirroring the teacher's `CancellationToken` shutdown pattern in
/// `client::client::ClientConnection`.
pub async fn run(
    config: EventLoopConfig,
    mut requests: mpsc::UnboundedReceiver<CoreRequest>,
    events: mpsc::UnboundedSender<CoreEvent>,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let socket = Rc::new(UdpSocket::bind("0.0.0.0:0").await?);
    info!(local_addr = ?socket.local_addr(), "DNS carrier socket bound");

    let bus = Rc::new(Bus::new());
    let _session_layer = SessionLayer::install(bus.clone());
    let _carrier = DnsCarrier::install(
        bus.clone(),
        config.domain_suffix,
        socket.clone(),
        config.upstream,
    );

    install_event_forwarding(&bus, events.clone());

    bus.post(&Message::Start);

    let mut heartbeat = time::interval(config.heartbeat_interval);
    let mut recv_buf = [0u8; 1024];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                bus.post(&Message::Shutdown);
                let _ = events.send(CoreEvent::Shutdown);
                return Ok(());
            }

            _ = heartbeat.tick() => {
                bus.post(&Message::Heartbeat);
            }

            recv = socket.recv_from(&mut recv_buf) => {
                match recv {
                    Ok((n, _from)) => _carrier.handle_datagram(&recv_buf[..n]),
                    Err(e) => {
                        error!(error = %e, "DNS carrier socket closed, terminating");
                        return Err(TunnelError::CarrierFatal(e));
                    }
                }
            }

            request = requests.recv() => {
                match request {
                    Some(CoreRequest::CreateSession { tunnel, reply }) => {
                        let msg = Message::create_session(tunnel);
                        bus.post(&msg);
                        let _ = reply.send(msg.take_session_id());
                    }
                    Some(CoreRequest::DataOut { session_id, bytes }) => {
                        bus.post(&Message::DataOut { session_id, bytes });
                    }
                    Some(CoreRequest::CloseSession { session_id }) => {
                        bus.post(&Message::CloseSession { session_id });
                    }
                    Some(CoreRequest::Shutdown) | None => {
                        bus.post(&Message::Shutdown);
                        let _ = events.send(CoreEvent::Shutdown);
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn install_event_forwarding(bus: &Rc<Bus>, events: mpsc::UnboundedSender<CoreEvent>) {
    let tx = events.clone();
    bus.subscribe(MessageKind::SessionCreated, move |msg| {
        if let Message::SessionCreated { session_id } = msg {
            let _ = tx.send(CoreEvent::SessionCreated {
                session_id: *session_id,
            });
        }
    });

    let tx = events.clone();
    bus.subscribe(MessageKind::DataIn, move |msg| {
        if let Message::DataIn { session_id, bytes } = msg {
            let _ = tx.send(CoreEvent::DataIn {
                session_id: *session_id,
                bytes: bytes.clone(),
            });
        }
    });

    bus.subscribe(MessageKind::SessionClosed, move |msg| {
        if let Message::SessionClosed { session_id } = msg {
            let _ = events.send(CoreEvent::SessionClosed {
                session_id: *session_id,
            });
        }
    });
}
