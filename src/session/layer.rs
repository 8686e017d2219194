// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cell::Cell, rc::Rc};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    bus::{Bus, Message, MessageKind},
    packet::{Packet, SynFlags},
    session::{LastSent, Session, SessionRegistry, SessionState, seq_diff},
    utils::random_u16,
};

/// `packet_id(2) + type(1) + session_id(2) + seq(2) + ack(2)`.
const MSG_HEADER_OVERHEAD: u32 = 9;

/// Drives every session's state machine off the bus: CREATE_SESSION,
/// HEARTBEAT, PACKET_IN, DATA_OUT, CLOSE_SESSION, SHUTDOWN in, SESSION_*
/// and PACKET_OUT out.
pub struct SessionLayer {
    bus: Rc<Bus>,
    registry: SessionRegistry,
    max_packet_length: Cell<u32>,
}

impl SessionLayer {
    /// Builds the layer and wires it to `bus`. The returned `Rc` is kept
    /// alive by the closures registered with the bus, so the caller may
    /// drop its own clone once construction-time wiring (e.g. handing the
    /// same `Rc` to drivers) is done.
    pub fn install(bus: Rc<Bus>) -> Rc<Self> {
        let layer = Rc::new(SessionLayer {
            bus: bus.clone(),
            registry: SessionRegistry::new(),
            max_packet_length: Cell::new(0),
        });

        let l = layer.clone();
        bus.subscribe(MessageKind::CreateSession, move |msg| {
            if let Message::CreateSession { tunnel, reply } = msg {
                let session_id = l.handle_create_session(tunnel.clone());
                *reply.borrow_mut() = Some(session_id);
            }
        });

        let l = layer.clone();
        bus.subscribe(MessageKind::Heartbeat, move |_| l.handle_heartbeat());

        let l = layer.clone();
        bus.subscribe(MessageKind::PacketIn, move |msg| {
            if let Message::PacketIn { packet } = msg {
                l.handle_packet_in(packet.clone());
            }
        });

        let l = layer.clone();
        bus.subscribe(MessageKind::DataOut, move |msg| {
            if let Message::DataOut { session_id, bytes } = msg {
                l.handle_data_out(*session_id, bytes);
            }
        });

        let l = layer.clone();
        bus.subscribe(MessageKind::CloseSession, move |msg| {
            if let Message::CloseSession { session_id } = msg {
                l.handle_close_session(*session_id);
            }
        });

        let l = layer.clone();
        bus.subscribe(MessageKind::ConfigInt, move |msg| {
            if let Message::ConfigInt { key, value } = msg
                && *key == "max_packet_length"
            {
                l.max_packet_length.set((*value).max(0) as u32);
            }
        });

        let l = layer.clone();
        bus.subscribe(MessageKind::Shutdown, move |_| l.registry.clear_silently());

        layer
    }

    /// Direct registry access, for tests and introspection; not part of the
    /// bus protocol.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn fresh_session_id(&self) -> u16 {
        loop {
            let candidate = random_u16();
            if !self.registry.contains(candidate) {
                return candidate;
            }
        }
    }

    fn handle_create_session(&self, tunnel: Option<(String, u16)>) -> u16 {
        let session_id = self.fresh_session_id();
        let initial_seq = random_u16();
        self.registry
            .create(Session::new(session_id, initial_seq, tunnel));
        session_id
    }

    fn handle_data_out(&self, session_id: u16, bytes: &Bytes) {
        let found = self.registry.with_session(session_id, |session| {
            if session.state == SessionState::Closed {
                warn!(session_id, "DATA_OUT on a closed session, discarding");
            } else {
                session.outgoing_buffer.extend_from_slice(bytes);
            }
        });
        if found.is_none() {
            warn!(session_id, "DATA_OUT for unknown session, discarding");
        }
    }

    fn handle_close_session(&self, session_id: u16) {
        let packet = self.registry.with_session(session_id, |session| {
            if session.state == SessionState::Closed {
                return None;
            }
            session.state = SessionState::Closed;
            Some(Packet::Fin {
                packet_id: random_u16(),
                session_id,
                reason: "closed".to_string(),
            })
        });
        if let Some(Some(packet)) = packet {
            self.bus.post(&Message::PacketOut { packet });
        }
        self.registry.close(session_id, &self.bus);
    }

    /// Picks exactly one session with work to do, in round-robin order, per
    /// the precedence in `spec.md` §4.4; falls back to PING if none has
    /// work.
    fn handle_heartbeat(&self) {
        for session_id in self.registry.round_robin_ids() {
            let packet = self.registry.with_session(session_id, |session| {
                self.next_outbound_packet(session)
            });
            if let Some(Some(packet)) = packet {
                self.bus.post(&Message::PacketOut { packet });
                return;
            }
        }

        self.bus.post(&Message::PacketOut {
            packet: Packet::Ping {
                packet_id: random_u16(),
                ping_id: random_u16(),
                data: Bytes::new(),
            },
        });
    }

    fn next_outbound_packet(&self, session: &mut Session) -> Option<Packet> {
        if session.state == SessionState::Closed {
            return None;
        }

        if let Some(last) = &session.last_sent_packet {
            return Some(self.rebuild_last_sent(session.session_id, session.their_seq, last));
        }

        if !session.outgoing_buffer.is_empty() {
            let budget = self
                .max_packet_length
                .get()
                .saturating_sub(MSG_HEADER_OVERHEAD) as usize;
            let take = session.outgoing_buffer.len().min(budget.max(1));
            let data = Bytes::copy_from_slice(&session.outgoing_buffer[..take]);

            session.last_sent_packet = Some(LastSent::Msg {
                seq: session.my_seq,
                data: data.clone(),
            });

            return Some(Packet::Msg {
                packet_id: random_u16(),
                session_id: session.session_id,
                seq: session.my_seq,
                ack: session.their_seq,
                data,
            });
        }

        if session.state == SessionState::New {
            let flags = if session.tunnel_target.is_some() {
                SynFlags::TUNNEL
            } else {
                SynFlags::empty()
            };
            session.last_sent_packet = Some(LastSent::Syn {
                initial_seq: session.my_seq,
                flags,
                name: session.name.clone(),
                tunnel: session.tunnel_target.clone(),
            });
            return Some(Packet::Syn {
                packet_id: random_u16(),
                session_id: session.session_id,
                initial_seq: session.my_seq,
                flags,
                name: session.name.clone(),
                tunnel: session.tunnel_target.clone(),
            });
        }

        None
    }

    fn rebuild_last_sent(&self, session_id: u16, their_seq: u16, last: &LastSent) -> Packet {
        match last {
            LastSent::Syn {
                initial_seq,
                flags,
                name,
                tunnel,
            } => Packet::Syn {
                packet_id: random_u16(),
                session_id,
                initial_seq: *initial_seq,
                flags: *flags,
                name: name.clone(),
                tunnel: tunnel.clone(),
            },
            LastSent::Msg { seq, data } => Packet::Msg {
                packet_id: random_u16(),
                session_id,
                seq: *seq,
                // Reflects bytes delivered since the original send, per
                // `spec.md` §9's buffer-ownership note.
                ack: their_seq,
                data: data.clone(),
            },
        }
    }

    fn handle_packet_in(&self, packet: Packet) {
        let Some(session_id) = packet.session_id() else {
            self.handle_ping_in(packet);
            return;
        };

        if !self.registry.contains(session_id) {
            debug!(session_id, "PACKET_IN for unknown session, replying FIN");
            self.bus.post(&Message::PacketOut {
                packet: Packet::Fin {
                    packet_id: random_u16(),
                    session_id,
                    reason: "unknown session".to_string(),
                },
            });
            return;
        }

        match packet {
            Packet::Syn {
                session_id,
                initial_seq,
                ..
            } => self.handle_syn_in(session_id, initial_seq),
            Packet::Msg {
                session_id,
                seq,
                ack,
                data,
                ..
            } => self.handle_msg_in(session_id, seq, ack, data),
            Packet::Fin {
                session_id, reason, ..
            } => self.handle_fin_in(session_id, reason),
            Packet::Ping { .. } => unreachable!("PING carries no session_id"),
        }
    }

    fn handle_syn_in(&self, session_id: u16, peer_initial_seq: u16) {
        let established = self.registry.with_session(session_id, |session| {
            if session.state != SessionState::New {
                debug!(session_id, "duplicate SYN-ack, ignoring");
                return false;
            }
            session.their_seq = peer_initial_seq;
            session.last_sent_packet = None;
            session.state = SessionState::Established;
            true
        });

        if established == Some(true) {
            self.bus.post(&Message::SessionCreated { session_id });
        }
    }

    fn handle_msg_in(&self, session_id: u16, peer_seq: u16, peer_ack: u16, data: Bytes) {
        let mut delivered: Option<Bytes> = None;

        self.registry.with_session(session_id, |session| {
            let n = seq_diff(peer_seq.wrapping_add(data.len() as u16), session.their_seq);
            if n > 0 && (n as usize) <= data.len() {
                let offset = data.len() - n as usize;
                let suffix = data.slice(offset..);
                session.incoming_buffer.extend_from_slice(&suffix);
                session.their_seq = session.their_seq.wrapping_add(n as u16);
                delivered = Some(suffix);
            }

            if let Some(LastSent::Msg {
                data: inflight_data,
                ..
            }) = &session.last_sent_packet
            {
                let acked = seq_diff(peer_ack, session.my_seq);
                if acked > 0 && (acked as usize) <= inflight_data.len() {
                    session.outgoing_buffer.drain(0..acked as usize);
                    session.my_seq = session.my_seq.wrapping_add(acked as u16);
                    session.last_sent_packet = None;
                }
            }
        });

        if let Some(bytes) = delivered {
            self.bus.post(&Message::DataIn { session_id, bytes });
        }
    }

    fn handle_fin_in(&self, session_id: u16, reason: String) {
        self.registry
            .with_session(session_id, |session| session.state = SessionState::Closed);
        self.registry.close(session_id, &self.bus);
        self.bus.post(&Message::PacketOut {
            packet: Packet::Fin {
                packet_id: random_u16(),
                session_id,
                reason,
            },
        });
    }

    fn handle_ping_in(&self, packet: Packet) {
        if let Packet::Ping {
            packet_id: _,
            ping_id,
            data,
        } = packet
        {
            self.bus.post(&Message::PacketOut {
                packet: Packet::Ping {
                    packet_id: random_u16(),
                    ping_id,
                    data,
                },
            });
        }
    }
}
