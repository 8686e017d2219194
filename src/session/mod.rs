// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-session reliable byte-stream state machine running on top of the
//! unreliable, polled carrier, plus the session registry.

pub mod layer;
pub mod registry;

use bytes::Bytes;

use crate::packet::SynFlags;

pub use layer::SessionLayer;
pub use registry::SessionRegistry;

/// `NEW --(send SYN, recv SYN-ack)--> ESTABLISHED --(send/recv MSG)-->
/// ESTABLISHED --(send or recv FIN, or SHUTDOWN)--> CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Established,
    Closed,
}

/// The packet currently in flight for a session (at most one at a time).
/// Holds reconstructible parameters rather than serialized bytes: `ack` in a
/// retransmitted MSG is recomputed from the session's current `their_seq` at
/// send time, so a retransmit can acknowledge bytes that arrived on a later
/// heartbeat than the original send.
#[derive(Debug, Clone)]
pub enum LastSent {
    Syn {
        initial_seq: u16,
        flags: SynFlags,
        name: Option<String>,
        tunnel: Option<(String, u16)>,
    },
    Msg {
        seq: u16,
        data: Bytes,
    },
}

/// Per-session state. Owned exclusively by the [`SessionRegistry`]; input
/// drivers hold only a `session_id` (a weak reference).
#[derive(Debug)]
pub struct Session {
    pub session_id: u16,
    pub state: SessionState,
    pub my_seq: u16,
    pub their_seq: u16,
    pub outgoing_buffer: Vec<u8>,
    pub incoming_buffer: Vec<u8>,
    pub name: Option<String>,
    pub tunnel_target: Option<(String, u16)>,
    pub last_sent_packet: Option<LastSent>,
}

impl Session {
    pub fn new(session_id: u16, initial_seq: u16, tunnel_target: Option<(String, u16)>) -> Self {
        let mut flags = SynFlags::empty();
        if tunnel_target.is_some() {
            flags |= SynFlags::TUNNEL;
        }
        Session {
            session_id,
            state: SessionState::New,
            my_seq: initial_seq,
            their_seq: 0,
            outgoing_buffer: Vec::new(),
            incoming_buffer: Vec::new(),
            name: None,
            tunnel_target: tunnel_target.clone(),
            last_sent_packet: Some(LastSent::Syn {
                initial_seq,
                flags,
                name: None,
                tunnel: tunnel_target,
            }),
        }
    }
}

/// Signed 16-bit difference `a - b`, tolerant of wraparound: comparisons
/// against the result stay correct as sequence numbers wrap past
/// `u16::MAX`.
pub fn seq_diff(a: u16, b: u16) -> i32 {
    (a.wrapping_sub(b) as i16) as i32
}
