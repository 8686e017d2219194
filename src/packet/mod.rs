// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Application-layer wire packets carried inside one carrier round-trip:
//! SYN, MSG, FIN, PING. The codec is a pure function — no I/O, no state —
//! encode/decode round-trips exactly (see the `tests` module and
//! `tests/scenarios.rs`).

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TunnelError;

const TYPE_SYN: u8 = 0x00;
const TYPE_MSG: u8 = 0x01;
const TYPE_FIN: u8 = 0x02;
const TYPE_PING: u8 = 0xFF;

bitflags! {
    /// Flag bits carried in a SYN packet. Only the two bits the spec names
    /// are defined; any other bit set is preserved through encode/decode but
    /// otherwise ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SynFlags: u16 {
        /// A NUL-terminated `name` string follows the flags field.
        const NAME = 0x01;
        /// A NUL-terminated `tunnel_host` string plus a `tunnel_port` u16
        /// follow (after `name`, if also present).
        const TUNNEL = 0x08;
    }
}

/// A decoded application packet. Fixed header `(packet_id, type,
/// session_id)` followed by a type-specific body; PING carries no
/// session_id (it is not attached to any session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Syn {
        packet_id: u16,
        session_id: u16,
        initial_seq: u16,
        flags: SynFlags,
        name: Option<String>,
        tunnel: Option<(String, u16)>,
    },
    Msg {
        packet_id: u16,
        session_id: u16,
        seq: u16,
        ack: u16,
        data: Bytes,
    },
    Fin {
        packet_id: u16,
        session_id: u16,
        reason: String,
    },
    Ping {
        packet_id: u16,
        ping_id: u16,
        data: Bytes,
    },
}

impl Packet {
    pub fn packet_id(&self) -> u16 {
        match self {
            Packet::Syn { packet_id, .. }
            | Packet::Msg { packet_id, .. }
            | Packet::Fin { packet_id, .. }
            | Packet::Ping { packet_id, .. } => *packet_id,
        }
    }

    /// `None` for PING, which is not attached to any session.
    pub fn session_id(&self) -> Option<u16> {
        match self {
            Packet::Syn { session_id, .. }
            | Packet::Msg { session_id, .. }
            | Packet::Fin { session_id, .. } => Some(*session_id),
            Packet::Ping { .. } => None,
        }
    }

    /// Serializes this packet to its wire form, big-endian.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);

        match self {
            Packet::Syn {
                packet_id,
                session_id,
                initial_seq,
                flags,
                name,
                tunnel,
            } => {
                buf.put_u16(*packet_id);
                buf.put_u8(TYPE_SYN);
                buf.put_u16(*session_id);
                buf.put_u16(*initial_seq);
                buf.put_u16(flags.bits());
                if flags.contains(SynFlags::NAME)
                    && let Some(name) = name
                {
                    put_cstr(&mut buf, name);
                }
                if flags.contains(SynFlags::TUNNEL)
                    && let Some((host, port)) = tunnel
                {
                    put_cstr(&mut buf, host);
                    buf.put_u16(*port);
                }
            },
            Packet::Msg {
                packet_id,
                session_id,
                seq,
                ack,
                data,
            } => {
                buf.put_u16(*packet_id);
                buf.put_u8(TYPE_MSG);
                buf.put_u16(*session_id);
                buf.put_u16(*seq);
                buf.put_u16(*ack);
                buf.put_slice(data);
            },
            Packet::Fin {
                packet_id,
                session_id,
                reason,
            } => {
                buf.put_u16(*packet_id);
                buf.put_u8(TYPE_FIN);
                buf.put_u16(*session_id);
                put_cstr(&mut buf, reason);
            },
            Packet::Ping {
                packet_id,
                ping_id,
                data,
            } => {
                buf.put_u16(*packet_id);
                buf.put_u8(TYPE_PING);
                buf.put_u16(*ping_id);
                buf.put_slice(data);
                buf.put_u8(0);
            },
        }

        buf.freeze()
    }

    /// Parses a wire packet. Any structural problem (truncated header,
    /// unknown type byte, missing NUL terminator) is a transient carrier
    /// error: logged and dropped by the caller, never propagated.
    pub fn decode(mut bytes: &[u8]) -> Result<Packet, TunnelError> {
        if bytes.len() < 3 {
            return Err(TunnelError::Transient("packet shorter than header".into()));
        }
        let packet_id = bytes.get_u16();
        let ty = bytes.get_u8();

        match ty {
            TYPE_SYN => {
                require(bytes.len() >= 6, "truncated SYN header")?;
                let session_id = bytes.get_u16();
                let initial_seq = bytes.get_u16();
                let flags = SynFlags::from_bits_truncate(bytes.get_u16());

                let name = if flags.contains(SynFlags::NAME) {
                    Some(take_cstr(&mut bytes)?)
                } else {
                    None
                };
                let tunnel = if flags.contains(SynFlags::TUNNEL) {
                    let host = take_cstr(&mut bytes)?;
                    require(bytes.len() >= 2, "truncated tunnel_port")?;
                    let port = bytes.get_u16();
                    Some((host, port))
                } else {
                    None
                };

                Ok(Packet::Syn {
                    packet_id,
                    session_id,
                    initial_seq,
                    flags,
                    name,
                    tunnel,
                })
            },
            TYPE_MSG => {
                require(bytes.len() >= 6, "truncated MSG header")?;
                let session_id = bytes.get_u16();
                let seq = bytes.get_u16();
                let ack = bytes.get_u16();
                let data = Bytes::copy_from_slice(bytes);
                Ok(Packet::Msg {
                    packet_id,
                    session_id,
                    seq,
                    ack,
                    data,
                })
            },
            TYPE_FIN => {
                require(bytes.len() >= 2, "truncated FIN header")?;
                let session_id = bytes.get_u16();
                let reason = take_cstr(&mut bytes)?;
                Ok(Packet::Fin {
                    packet_id,
                    session_id,
                    reason,
                })
            },
            TYPE_PING => {
                require(bytes.len() >= 2, "truncated PING header")?;
                let ping_id = bytes.get_u16();
                let data = if bytes.last() == Some(&0) {
                    Bytes::copy_from_slice(&bytes[..bytes.len() - 1])
                } else {
                    Bytes::copy_from_slice(bytes)
                };
                Ok(Packet::Ping {
                    packet_id,
                    ping_id,
                    data,
                })
            },
            other => Err(TunnelError::Transient(format!("unknown packet type {other:#x}"))),
        }
    }
}

fn require(cond: bool, what: &str) -> Result<(), TunnelError> {
    if cond {
        Ok(())
    } else {
        Err(TunnelError::Transient(what.to_string()))
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn take_cstr(bytes: &mut &[u8]) -> Result<String, TunnelError> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TunnelError::Transient("missing NUL terminator".into()))?;
    let s = String::from_utf8_lossy(&bytes[..nul]).into_owned();
    bytes.advance(nul + 1);
    Ok(s)
}
